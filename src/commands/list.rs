use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::IpcRequest;
use crate::process::Process;

use super::common::{dash_if_zero, request};

pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    let response = request(config, IpcRequest::List).await?;
    print_process_table(response.processes);

    Ok(())
}

pub(crate) fn print_process_table(processes: Vec<Process>) {
    if processes.is_empty() {
        println!("No managed processes.");
        return;
    }

    let headers = [
        "ID", "NAME", "STATUS", "PID", "UPTIME", "RESTARTS", "CPU", "MEMORY",
    ];
    let rows: Vec<[String; 8]> = processes.into_iter().map(table_row).collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.len());
        }
    }

    print_border(&widths);
    print_row(&headers, &widths);
    print_border(&widths);
    for row in &rows {
        let cells = row.each_ref().map(String::as_str);
        print_row(&cells, &widths);
    }
    print_border(&widths);
}

fn table_row(process: Process) -> [String; 8] {
    let uptime = if process.is_online() {
        format_uptime(process.status.uptime_secs)
    } else {
        "-".to_string()
    };
    [
        process.id.to_string(),
        process.name,
        process.status.status.to_string(),
        dash_if_zero(process.pid),
        uptime,
        process.status.restarts.to_string(),
        process.status.cpu,
        process.status.memory,
    ]
}

pub(crate) fn format_uptime(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

fn print_border(widths: &[usize; 8]) {
    print!("+");
    for width in widths {
        print!("-{}-+", "-".repeat(*width));
    }
    println!();
}

fn print_row(cells: &[&str; 8], widths: &[usize; 8]) {
    print!("|");
    for (idx, cell) in cells.iter().enumerate() {
        print!(" {:<width$} |", cell, width = widths[idx]);
    }
    println!();
}
