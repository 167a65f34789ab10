//! Board commands: boards, scan, run, exec, repl, time, ip, mac.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mpsh::{Bridge, BridgeExit, Device};

use crate::Session;

pub fn scan() -> Result<()> {
    let ports = mpsh::scan()?;
    if ports.is_empty() {
        println!("No boards found.");
        return Ok(());
    }
    for port in &ports {
        println!(
            "{:<20} {:04x}:{:04x}  {}",
            port.path,
            port.vid,
            port.pid,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub fn boards(session: &Session) -> Result<()> {
    let default = session.registry.default_device();
    println!("{:<2}{:<16} {:<24} {:<10} {:<4} DIRS", "", "NAME", "ENDPOINT", "STATUS", "ID");
    for dev in session.registry.list() {
        let mark = if default.as_ref().is_some_and(|d| Arc::ptr_eq(d, &dev)) {
            "*"
        } else {
            ""
        };
        println!(
            "{mark:<2}{:<16} {:<24} {:<10} {:<4} {}",
            dev.name(),
            dev.endpoint().to_string(),
            dev.status().to_string(),
            dev.id(),
            dev.root_dirs().join(" ")
        );
    }
    Ok(())
}

pub fn run(dev: &Device, file: &Path) -> Result<()> {
    let out = dev
        .execfile(file)
        .with_context(|| format!("running {}", file.display()))?;
    print!("{out}");
    Ok(())
}

pub fn exec(dev: &Device, code: &str) -> Result<()> {
    print!("{}", dev.exec(code)?);
    Ok(())
}

pub fn repl(dev: &Device, line: &str) -> Result<()> {
    let unattended = line.trim_end().ends_with('~');
    if !unattended {
        eprintln!(
            "Entering REPL on {}. Use Control-{} to exit.",
            dev.name(),
            char::from(mpsh::QUIT_KEY + b'@')
        );
    }

    #[cfg(unix)]
    let _raw = if unattended {
        None
    } else {
        crate::term::RawMode::enable()?
    };

    let exit = Bridge::new(dev)
        .initial_line(line)
        .run(io::stdin().lock(), io::stdout())?;

    #[cfg(unix)]
    drop(_raw);
    match exit {
        BridgeExit::Quit => println!(),
        BridgeExit::Idle => {}
        BridgeExit::Disconnected => eprintln!("{} disconnected", dev.name()),
    }
    io::stdout().flush()?;
    Ok(())
}

pub fn time(dev: &Device, now: bool) -> Result<()> {
    if now {
        dev.sync_time()?;
    }
    match dev.time()? {
        Some(t) => println!("{t}"),
        None => println!("unknown"),
    }
    Ok(())
}

pub fn ip(dev: &Device) -> Result<()> {
    println!("{}", dev.ip_address()?.as_deref().unwrap_or("none"));
    Ok(())
}

pub fn mac(dev: &Device) -> Result<()> {
    println!("{}", dev.mac_address()?.as_deref().unwrap_or("none"));
    Ok(())
}
