//! rclone backend

use super::{MountPlan, MountRequest, Mounter};
use crate::domain::ports::Invocation;

const RCLONE_CMD: &str = "rclone";

/// `bucket/prefix`, or just the bucket for a whole-bucket volume
fn remote_path(bucket: &str, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        bucket.to_string()
    } else {
        format!("{}/{}", bucket, prefix)
    }
}

pub(crate) fn plan(request: &MountRequest<'_>) -> MountPlan {
    let credentials = request.credentials;
    let mut invocation = Invocation::new(RCLONE_CMD)
        .arg("mount")
        .arg(format!(
            ":s3:{}",
            remote_path(&request.volume.bucket, &request.volume.prefix)
        ))
        .arg(request.target.to_string_lossy().into_owned())
        .args(["--daemon", "--s3-provider=AWS", "--s3-env-auth=true"]);
    if !credentials.endpoint.is_empty() {
        invocation = invocation.arg(format!("--s3-endpoint={}", credentials.endpoint));
    }
    invocation = invocation.args(["--allow-other", "--vfs-cache-mode=writes"]);
    if !credentials.region.is_empty() {
        invocation = invocation.arg(format!("--s3-region={}", credentials.region));
    }
    let invocation = request.aws_env(invocation.args(request.volume.mount_options.iter().cloned()));

    MountPlan {
        backend: Mounter::Rclone,
        direct: invocation,
        host: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounter::test_support::{credentials, volume};
    use std::path::Path;

    #[test]
    fn test_rclone_invocation() {
        let volume = volume(&["--read-only"]);
        let credentials = credentials();
        let request = MountRequest {
            volume_id: "data/pvc-1",
            volume: &volume,
            credentials: &credentials,
            target: Path::new("/stage"),
        };
        let plan = plan(&request);

        assert!(plan.host.is_none());
        assert_eq!(
            plan.direct.argv(),
            vec![
                "rclone",
                "mount",
                ":s3:data/pvc-1",
                "/stage",
                "--daemon",
                "--s3-provider=AWS",
                "--s3-env-auth=true",
                "--s3-endpoint=https://storage.example.com",
                "--allow-other",
                "--vfs-cache-mode=writes",
                "--s3-region=ru-central1",
                "--read-only",
            ]
        );
        assert!(plan
            .direct
            .env
            .contains(&("AWS_SECRET_ACCESS_KEY".to_string(), "secret".to_string())));
        assert!(!plan.direct.args.iter().any(|a| a.contains("secret")));
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("data", ""), "data");
        assert_eq!(remote_path("data", "pvc-1/"), "data/pvc-1");
    }
}
