// SPDX-License-Identifier: GPL-3.0-only

//! LVM volume group activation through the `lvm` tool.

use crate::command::CommandRunner;
use crate::{Result, SysError};

const LVM: &str = "lvm";

/// Volume groups `pvscan --listvg --checkcomplete` reports as complete.
pub fn parse_complete_vgs(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("VG "))
        .filter(|line| !line.contains("incomplete"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Register the physical volume at `dev_path` and return the volume
/// groups that became complete.
pub fn pvscan(runner: &dyn CommandRunner, dev_path: &str) -> Result<Vec<String>> {
    if !cfg!(feature = "lvm-tools") {
        return Ok(Vec::new());
    }

    let outcome = runner.run(
        LVM,
        &[
            "pvscan",
            "--cache",
            "--listvg",
            "--checkcomplete",
            "--vgonline",
            "--autoactivation",
            "event",
            dev_path,
        ],
        None,
    )?;

    Ok(parse_complete_vgs(&outcome.stdout))
}

pub fn activate_vg(runner: &dyn CommandRunner, vg: &str) -> Result<()> {
    if !cfg!(feature = "lvm-tools") {
        return Err(SysError::ToolMissing(LVM.to_string()));
    }

    runner.run(LVM, &["vgchange", "-aay", "--autoactivation", "event", vg], None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_complete_groups_only() {
        let output = "  pvscan[1234] PV /dev/sdb online.\n  VG vg0 complete\n  VG vg1 incomplete\n\n  VG data\n";
        assert_eq!(parse_complete_vgs(output), vec!["vg0".to_string(), "data".to_string()]);
        assert!(parse_complete_vgs("").is_empty());
    }
}
