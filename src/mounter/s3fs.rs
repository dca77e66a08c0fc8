//! s3fs backend
//!
//! s3fs reads credentials from a password file. Each volume gets its own
//! file so credentials are never shared across volumes.

use super::systemd::bus_escape;
use super::{MountPlan, MountRequest, Mounter, MounterConfig};
use crate::domain::ports::{Invocation, SecretFile};
use std::path::{Path, PathBuf};

const S3FS_CMD: &str = "s3fs";

/// Password file of one volume under `secrets_dir`
pub fn credential_file(secrets_dir: &Path, volume_id: &str) -> PathBuf {
    secrets_dir.join(format!("{}.passwd-s3fs", bus_escape(volume_id)))
}

pub(crate) fn plan(request: &MountRequest<'_>, config: &MounterConfig) -> MountPlan {
    let credentials = request.credentials;
    let passwd_file = credential_file(&config.secrets_dir, request.volume_id);

    let mut invocation = Invocation::new(S3FS_CMD)
        .arg(format!("{}:/{}", request.volume.bucket, request.volume.prefix))
        .arg(request.target.to_string_lossy().into_owned())
        .args(["-o", "use_path_request_style"])
        .args(["-o".to_string(), format!("url={}", credentials.endpoint)])
        .args(["-o".to_string(), format!("passwd_file={}", passwd_file.display())])
        .args(["-o", "allow_other", "-o", "mp_umask=000"]);
    if !credentials.region.is_empty() {
        invocation = invocation.args(["-o".to_string(), format!("endpoint={}", credentials.region)]);
    }
    invocation = invocation.args(request.volume.mount_options.iter().cloned());
    invocation.files.push(SecretFile {
        path: passwd_file,
        contents: format!(
            "{}:{}",
            credentials.access_key_id, credentials.secret_access_key
        ),
    });

    MountPlan {
        backend: Mounter::S3fs,
        direct: invocation,
        host: None,
    }
}
