use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::IpcRequest;

use super::common::{dash_if_zero, request};
use super::list::format_uptime;

pub(crate) async fn run(config: &AppConfig, target: String) -> Result<()> {
    let response = request(
        config,
        IpcRequest::Find {
            target: target.clone(),
        },
    )
    .await?;
    let Some(process) = response.process else {
        anyhow::bail!("no process matches {target}");
    };

    println!("ID:           {}", process.id);
    println!("Name:         {}", process.name);
    println!("Status:       {}", process.status.status);
    println!("PID:          {}", dash_if_zero(process.pid));
    println!("Parent PID:   {}", dash_if_zero(process.status.parent_pid));
    println!("Started At:   {}", process.status.started_at.to_rfc3339());
    println!("Uptime:       {}", format_uptime(process.status.uptime_secs));
    println!("Restarts:     {}", process.status.restarts);
    println!("Auto Restart: {}", process.auto_restart);
    if let Some(cron) = process.cron_restart.as_deref() {
        println!("Cron:         {cron}");
    }
    if let Some(next) = process.next_start_at {
        println!("Next Start:   {}", next.to_rfc3339());
    }
    println!("CPU:          {}", process.status.cpu);
    println!("Memory:       {}", process.status.memory);
    println!(
        "Command:      {} {}",
        process.executable_path,
        process.args.join(" ")
    );
    println!("Working Dir:  {}", process.cwd.display());
    for script in &process.scripts {
        println!("Script:       {script}");
    }
    println!("PID File:     {}", process.pid_file_path.display());
    println!("Stdout Log:   {}", process.log_file_path.display());
    println!("Stderr Log:   {}", process.err_file_path.display());

    Ok(())
}
