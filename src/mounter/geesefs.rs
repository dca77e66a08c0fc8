//! GeeseFS backend
//!
//! The only backend that can run as a host service unit: it stays in the
//! foreground with `-f`, so the service manager owns its lifetime.

use super::options::split_host_unsafe;
use super::{HostInvocation, MountPlan, MountRequest, Mounter, MounterConfig};
use crate::domain::ports::Invocation;

const GEESEFS_CMD: &str = "geesefs";

/// Unprivileged uid/gid the mount process switches to (nobody/nogroup)
const NOBODY: &str = "65534";

pub(crate) fn plan(request: &MountRequest<'_>, config: &MounterConfig) -> MountPlan {
    let full_path = format!("{}:{}", request.volume.bucket, request.volume.prefix);
    let target = request.target.to_string_lossy().into_owned();
    let endpoint = &request.credentials.endpoint;

    let mut args = Vec::new();
    if !request.credentials.region.is_empty() {
        args.push("--region".to_string());
        args.push(request.credentials.region.clone());
    }
    args.extend(["--setuid", NOBODY, "--setgid", NOBODY].map(String::from));

    let filtered = split_host_unsafe(&request.volume.mount_options);
    args.extend(filtered.args);

    // Local-file options only apply when we know we run in-container.
    let mut direct_args = args.clone();
    if !filtered.use_host {
        direct_args.extend(filtered.host_unsafe);
    }
    direct_args.push(full_path.clone());
    direct_args.push(target.clone());

    let mut direct = Invocation::new(GEESEFS_CMD);
    if !endpoint.is_empty() {
        direct = direct.arg("--endpoint").arg(endpoint.clone());
    }
    let direct = request.aws_env(
        direct
            .args(["-o", "allow_other", "--log-file", "/dev/stderr"])
            .args(direct_args),
    );

    let host = filtered.use_host.then(|| {
        let program = config.host_plugin_dir.join(GEESEFS_CMD);
        let mut invocation = Invocation::new(program.to_string_lossy().into_owned())
            .args(["-f", "-o", "allow_other"]);
        if !endpoint.is_empty() {
            invocation = invocation.arg("--endpoint").arg(endpoint.clone());
        }
        let invocation = request.aws_env(invocation.args(args).arg(full_path).arg(target));

        HostInvocation {
            invocation,
            bundled_binary: config.bundled_binary_dir.join(GEESEFS_CMD),
            staged_binary: config.staged_binary_dir.join(GEESEFS_CMD),
        }
    });

    MountPlan {
        backend: Mounter::GeeseFs,
        direct,
        host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounter::test_support::{credentials, volume};
    use std::path::Path;

    fn request_plan(options: &[&str]) -> MountPlan {
        let volume = volume(options);
        let credentials = credentials();
        let request = MountRequest {
            volume_id: "data/pvc-1",
            volume: &volume,
            credentials: &credentials,
            target: Path::new("/var/lib/kubelet/stage/pvc-1"),
        };
        plan(&request, &MounterConfig::default())
    }

    #[test]
    fn test_host_invocation_layout() {
        let plan = request_plan(&["--memory-limit", "1000"]);
        let host = plan.host.expect("host invocation");

        assert_eq!(
            host.invocation.argv(),
            vec![
                "/var/lib/kubelet/plugins/s3.volume-agent.io/geesefs",
                "-f",
                "-o",
                "allow_other",
                "--endpoint",
                "https://storage.example.com",
                "--region",
                "ru-central1",
                "--setuid",
                "65534",
                "--setgid",
                "65534",
                "--memory-limit",
                "1000",
                "data:pvc-1",
                "/var/lib/kubelet/stage/pvc-1",
            ]
        );
        assert_eq!(host.bundled_binary, Path::new("/usr/bin/geesefs"));
        assert_eq!(host.staged_binary, Path::new("/csi/geesefs"));
        let keys: Vec<&str> = host.invocation.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]);
    }

    #[test]
    fn test_unsafe_options_dropped_for_host() {
        let plan = request_plan(&["--log-file", "/tmp/my log", "--cache=/tmp/cache"]);

        let host = plan.host.expect("host invocation");
        assert!(!host.invocation.args.iter().any(|a| a.contains("/tmp/")));
        // The in-container fallback keeps them out too: the plan was made for the host.
        assert!(!plan.direct.args.iter().any(|a| a.contains("/tmp/")));
    }

    #[test]
    fn test_unsafe_options_kept_in_container() {
        let plan = request_plan(&["--no-systemd", "--log-file", "/tmp/my log"]);

        assert!(plan.host.is_none());
        let args = &plan.direct.args;
        assert_eq!(plan.direct.program, "geesefs");
        assert_eq!(&args[..6], &["--endpoint", "https://storage.example.com", "-o", "allow_other", "--log-file", "/dev/stderr"]);
        let pos = args.iter().position(|a| a == "/tmp/my log").unwrap();
        assert_eq!(args[pos - 1], "--log-file");
        assert_eq!(args[args.len() - 2], "data:pvc-1");
        assert_eq!(args[args.len() - 1], "/var/lib/kubelet/stage/pvc-1");
    }
}
