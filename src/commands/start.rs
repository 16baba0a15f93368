use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::ipc::IpcRequest;
use crate::process::ProcessDescriptor;

use super::common::{request, request_and_report};

pub(crate) struct StartArgs {
    pub(crate) target: String,
    pub(crate) args: Vec<String>,
    pub(crate) name: Option<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) no_autorestart: bool,
    pub(crate) cron: Option<String>,
    pub(crate) scripts: Vec<String>,
    pub(crate) pid: Option<u32>,
}

/// A bare target naming a registered process starts that process again;
/// anything else is a new descriptor.
pub(crate) async fn run(config: &AppConfig, args: StartArgs) -> Result<()> {
    if is_bare_target(&args) && is_app_file(Path::new(&args.target)) {
        return start_app_file(config, Path::new(&args.target)).await;
    }

    if is_bare_target(&args) {
        let found = request(
            config,
            IpcRequest::Find {
                target: args.target.clone(),
            },
        )
        .await?;
        if let Some(existing) = found.process {
            return request_and_report(
                config,
                IpcRequest::Start {
                    descriptor: Box::new(existing.descriptor()),
                },
            )
            .await;
        }
    }

    let descriptor = build_descriptor(args)?;
    request_and_report(
        config,
        IpcRequest::Add {
            descriptor: Box::new(descriptor),
        },
    )
    .await
}

/// One entry of a JSON app file: `[{"name", "executablePath", "args", "autorestart"}]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppFileEntry {
    name: String,
    executable_path: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_autorestart", rename = "autorestart")]
    auto_restart: bool,
    #[serde(default)]
    cron_restart: Option<String>,
}

fn default_autorestart() -> bool {
    true
}

fn is_app_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"))
}

/// Registered names are restarted, unknown ones added.
async fn start_app_file(config: &AppConfig, path: &Path) -> Result<()> {
    for descriptor in load_app_file(path)? {
        let name = descriptor.name.clone().unwrap_or_default();
        let found = request(
            config,
            IpcRequest::Find {
                target: name.clone(),
            },
        )
        .await?;

        let next = if found.process.is_some() {
            IpcRequest::Restart { target: name }
        } else {
            IpcRequest::Add {
                descriptor: Box::new(descriptor),
            }
        };
        request_and_report(config, next).await?;
    }
    Ok(())
}

// Entries run from the directory holding the file.
fn load_app_file(path: &Path) -> Result<Vec<ProcessDescriptor>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read app file {}", path.display()))?;
    let entries: Vec<AppFileEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse app file {}", path.display()))?;
    let cwd = fs::canonicalize(path)?
        .parent()
        .map(Path::to_path_buf)
        .context("app file has no parent directory")?;

    entries
        .into_iter()
        .map(|entry| {
            if entry.name.trim().is_empty() {
                anyhow::bail!("app file {} has an entry without a name", path.display());
            }
            Ok(ProcessDescriptor {
                name: Some(entry.name),
                executable_path: entry.executable_path,
                args: entry.args,
                cwd: Some(cwd.clone()),
                auto_restart: entry.auto_restart,
                cron_restart: entry.cron_restart,
                scripts: Vec::new(),
                pid: None,
            })
        })
        .collect()
}

fn is_bare_target(args: &StartArgs) -> bool {
    args.args.is_empty()
        && args.name.is_none()
        && args.cwd.is_none()
        && args.cron.is_none()
        && args.scripts.is_empty()
        && args.pid.is_none()
        && !args.no_autorestart
}

fn build_descriptor(args: StartArgs) -> Result<ProcessDescriptor> {
    let cwd = match args.cwd {
        Some(cwd) => Some(cwd),
        None => Some(std::env::current_dir()?),
    };

    Ok(ProcessDescriptor {
        name: args.name,
        executable_path: args.target,
        args: args.args,
        cwd,
        auto_restart: !args.no_autorestart,
        cron_restart: args.cron,
        scripts: args.scripts,
        pid: args.pid,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{build_descriptor, is_app_file, is_bare_target, load_app_file, StartArgs};

    fn args(target: &str) -> StartArgs {
        StartArgs {
            target: target.to_string(),
            args: Vec::new(),
            name: None,
            cwd: None,
            no_autorestart: false,
            cron: None,
            scripts: Vec::new(),
            pid: None,
        }
    }

    #[test]
    fn bare_target_only_without_spawn_options() {
        assert!(is_bare_target(&args("api")));

        let mut with_args = args("sleep");
        with_args.args.push("30".to_string());
        assert!(!is_bare_target(&with_args));

        let mut once = args("job.sh");
        once.no_autorestart = true;
        assert!(!is_bare_target(&once));
    }

    #[test]
    fn descriptor_uses_client_cwd_and_inverts_autorestart() {
        let mut start = args("./server");
        start.no_autorestart = true;
        start.cwd = Some(PathBuf::from("/srv/app"));
        start.cron = Some("0 3 * * *".to_string());

        let descriptor = build_descriptor(start).expect("descriptor");
        assert_eq!(descriptor.executable_path, "./server");
        assert_eq!(descriptor.cwd, Some(PathBuf::from("/srv/app")));
        assert!(!descriptor.auto_restart);
        assert_eq!(descriptor.cron_expr(), Some("0 3 * * *"));

        let descriptor = build_descriptor(args("sleep")).expect("descriptor");
        assert!(descriptor.auto_restart);
        assert!(descriptor.cwd.is_some());
    }

    #[test]
    fn app_file_entries_become_descriptors() {
        let dir = temp_dir("app-file");
        let path = dir.join("apps.json");
        fs::write(
            &path,
            r#"[
                {"name": "api", "executablePath": "./server", "args": ["--port", "8080"]},
                {"name": "backup", "executablePath": "backup.sh", "autorestart": false,
                 "cronRestart": "0 3 * * 0"}
            ]"#,
        )
        .expect("failed to write app file");

        assert!(is_app_file(&path));
        let descriptors = load_app_file(&path).expect("app file should load");
        assert_eq!(descriptors.len(), 2);

        let api = &descriptors[0];
        assert_eq!(api.name.as_deref(), Some("api"));
        assert_eq!(api.executable_path, "./server");
        assert_eq!(api.args, vec!["--port".to_string(), "8080".to_string()]);
        assert!(api.auto_restart);
        let canonical_dir = fs::canonicalize(&dir).expect("canonical dir");
        assert_eq!(api.cwd.as_deref(), Some(canonical_dir.as_path()));

        let backup = &descriptors[1];
        assert!(!backup.auto_restart);
        assert_eq!(backup.cron_expr(), Some("0 3 * * 0"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn app_file_requires_json_array_with_names() {
        let dir = temp_dir("app-file-bad");
        let object = dir.join("object.json");
        fs::write(&object, r#"{"name": "api", "executablePath": "sleep"}"#).expect("write");
        assert!(load_app_file(&object).is_err());

        let unnamed = dir.join("unnamed.json");
        fs::write(&unnamed, r#"[{"name": " ", "executablePath": "sleep"}]"#).expect("write");
        assert!(load_app_file(&unnamed).is_err());

        let script = dir.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").expect("write");
        assert!(!is_app_file(&script));
        assert!(!is_app_file(&dir.join("missing.json")));

        let _ = fs::remove_dir_all(&dir);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("overseer-{prefix}-{nonce}"));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }
}
