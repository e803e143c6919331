//! Default AppArmor profile for container processes.
//!
//! The profile text lives under `<root>/lsm/apparmor/` and is loaded with
//! `apparmor_parser`. Hosts without AppArmor keep running unconfined.

use std::path::Path;

use raind_common::{CommandRunner, RaindResult, fs};

const ENABLED_PARAM: &str = "/sys/module/apparmor/parameters/enabled";

/// Whether the running kernel enforces AppArmor.
#[must_use]
pub fn is_enabled() -> bool {
    std::fs::read_to_string(ENABLED_PARAM).is_ok_and(|value| value.trim() == "Y")
}

/// Profile text for `name`.
#[must_use]
pub fn render(name: &str) -> String {
    format!(
        r"#include <tunables/global>

profile {name} flags=(attach_disconnected,mediate_deleted) {{
  #include <abstractions/base>

  network,
  capability,
  file,
  umount,
  signal (receive) peer=unconfined,
  signal (send,receive) peer={name},

  deny @{{PROC}}/* w,
  deny @{{PROC}}/{{[^1-9],[^1-9][^0-9],[^1-9s][^0-9y][^0-9s],[^1-9][^0-9][^0-9][^0-9]*}}/** w,
  deny @{{PROC}}/sys/[^k]** w,
  deny @{{PROC}}/sys/kernel/{{?,??,[^s][^h][^m]**}} w,
  deny @{{PROC}}/sysrq-trigger rwklx,
  deny @{{PROC}}/kcore rwklx,
  deny mount,
  deny /sys/[^f]*/** wklx,
  deny /sys/f[^s]*/** wklx,
  deny /sys/fs/[^c]*/** wklx,
  deny /sys/fs/c[^g]*/** wklx,
  deny /sys/fs/cg[^r]*/** wklx,
  deny /sys/firmware/** rwklx,
  deny /sys/kernel/security/** rwklx,

  ptrace (trace,read,tracedby,readby) peer={name},
}}
"
    )
}

/// Write the profile for `name` to `path` unless it exists, then load it.
///
/// Does nothing when AppArmor is disabled. A failed load is logged and
/// containers run without confinement.
///
/// # Errors
///
/// Returns I/O errors writing the profile.
pub async fn install(runner: &dyn CommandRunner, path: &Path, name: &str) -> RaindResult<()> {
    install_with(runner, path, name, is_enabled()).await
}

async fn install_with(
    runner: &dyn CommandRunner,
    path: &Path,
    name: &str,
    enabled: bool,
) -> RaindResult<()> {
    if !enabled {
        tracing::warn!(profile = %name, "AppArmor not enabled, skipping profile load");
        return Ok(());
    }
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fs::atomic_write(path, render(name).as_bytes())?;
    }
    let args = vec!["-r".to_string(), "-W".to_string(), path.display().to_string()];
    match runner.run("apparmor_parser", &args).await {
        Ok(_) => tracing::info!(profile = %name, "AppArmor profile loaded"),
        Err(err) => tracing::warn!(profile = %name, error = %err, "AppArmor profile not loaded"),
    }
    Ok(())
}
