use anyhow::Result;

use crate::cli::ConfigCommand;
use crate::config::{parse_size, AppConfig, LogRotateSettings};

pub(crate) fn run(config: &AppConfig, command: Option<ConfigCommand>) -> Result<()> {
    let mut settings = config.log_rotate_settings()?;

    if let Some(ConfigCommand::Set { key, value }) = command {
        apply(&mut settings, &key, &value)?;
        config.save_log_rotate_settings(&settings)?;
        println!("Updated {key}. Restart the daemon for the change to take effect.");
    }

    println!("logrotate:           {}", settings.enabled);
    println!("logrotate_size:      {}", settings.max_size_bytes);
    println!("logrotate_max_files: {}", settings.max_files);
    Ok(())
}

fn apply(settings: &mut LogRotateSettings, key: &str, value: &str) -> Result<()> {
    match key {
        "logrotate" => {
            settings.enabled = value
                .trim()
                .parse::<bool>()
                .map_err(|_| anyhow::anyhow!("logrotate expects true or false"))?;
        }
        "logrotate_size" => settings.max_size_bytes = parse_size(value)?,
        "logrotate_max_files" => {
            settings.max_files = value
                .trim()
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("logrotate_max_files expects a number"))?;
        }
        other => anyhow::bail!(
            "unknown setting {other:?} (expected logrotate, logrotate_size or logrotate_max_files)"
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::apply;
    use crate::config::LogRotateSettings;

    #[test]
    fn apply_updates_known_keys() {
        let mut settings = LogRotateSettings::default();
        apply(&mut settings, "logrotate", "true").expect("bool");
        apply(&mut settings, "logrotate_size", "5M").expect("size");
        apply(&mut settings, "logrotate_max_files", "3").expect("count");

        assert!(settings.enabled);
        assert_eq!(settings.max_size_bytes, 5 * 1024 * 1024);
        assert_eq!(settings.max_files, 3);
    }

    #[test]
    fn apply_rejects_unknown_keys_and_bad_values() {
        let mut settings = LogRotateSettings::default();
        assert!(apply(&mut settings, "rotate", "true").is_err());
        assert!(apply(&mut settings, "logrotate", "yes").is_err());
        assert!(apply(&mut settings, "logrotate_max_files", "-1").is_err());
        assert_eq!(settings, LogRotateSettings::default());
    }
}
