//! `autolaunch:` resolution through the platform launcher.

use std::fs;
use std::process::Command;

use log::trace;

use crate::address::{parse_list, Address};
use crate::{Error, Result};

const MACHINE_ID_PATHS: [&str; 2] = ["/var/lib/dbus/machine-id", "/etc/machine-id"];

/// Invoke `dbus-launch --autolaunch <machine-uuid> --binary-syntax` and
/// parse its output as a fresh candidate list.
///
/// The output line is cut at the first NUL byte when one is present (the
/// binary-syntax form appends binary pid/window data after it), otherwise at
/// the first newline; any further output is ignored.
pub(crate) fn launch() -> Result<Vec<Address>> {
    let uuid = machine_uuid()?;
    trace!("invoking dbus-launch for machine {uuid}");

    let output = Command::new("dbus-launch")
        .arg("--autolaunch")
        .arg(&uuid)
        .arg("--binary-syntax")
        .output()
        .map_err(|e| Error::Launcher(format!("failed to run dbus-launch: {e}")))?;
    if !output.status.success() {
        return Err(Error::Launcher(format!(
            "dbus-launch exited with {}",
            output.status
        )));
    }

    let stdout = &output.stdout;
    let line = match stdout.iter().position(|&b| b == 0) {
        Some(nul) => &stdout[..nul],
        None => match stdout.iter().position(|&b| b == b'\n') {
            Some(newline) => &stdout[..newline],
            None => stdout,
        },
    };
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::Launcher("dbus-launch output is not valid UTF-8".to_owned()))?
        .trim();
    if line.is_empty() {
        return Err(Error::Launcher(
            "dbus-launch produced no address".to_owned(),
        ));
    }

    parse_list(line).map_err(|e| Error::Launcher(format!("bad launcher address: {e}")))
}

fn machine_uuid() -> Result<String> {
    for path in MACHINE_ID_PATHS {
        if let Ok(contents) = fs::read_to_string(path) {
            let id = contents.trim();
            if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Ok(id.to_ascii_lowercase());
            }
        }
    }

    Err(Error::Launcher(
        "no D-Bus machine UUID found on this system".to_owned(),
    ))
}
