//! goofys backend

use super::{MountPlan, MountRequest, Mounter};
use crate::domain::ports::Invocation;

const GOOFYS_CMD: &str = "goofys";

/// goofys needs a region as soon as a custom endpoint is set
const DEFAULT_REGION: &str = "us-east-1";

pub(crate) fn plan(request: &MountRequest<'_>) -> MountPlan {
    let credentials = request.credentials;
    let region = match credentials.region.as_str() {
        "" if !credentials.endpoint.is_empty() => DEFAULT_REGION,
        region => region,
    };

    let mut invocation = Invocation::new(GOOFYS_CMD);
    if !credentials.endpoint.is_empty() {
        invocation = invocation.arg("--endpoint").arg(credentials.endpoint.clone());
    }
    if !region.is_empty() {
        invocation = invocation.arg("--region").arg(region);
    }
    // goofys stops parsing flags at the first positional argument.
    let invocation = invocation
        .args(["-o", "allow_other"])
        .args(request.volume.mount_options.iter().cloned())
        .arg(format!("{}:{}", request.volume.bucket, request.volume.prefix))
        .arg(request.target.to_string_lossy().into_owned());

    MountPlan {
        backend: Mounter::Goofys,
        direct: request.aws_env(invocation),
        host: None,
    }
}
