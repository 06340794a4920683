//! Deny-list of irreversibly destructive shell commands.
//!
//! This is a footgun guard, not a sandbox: quoting, variables, aliases or
//! encoded payloads walk straight past it. Isolation has to come from where
//! the shell runs.

use std::sync::OnceLock;

use regex::Regex;

use super::error::SessionError;

/// (name, pattern, reason) for each blocked operation.
const DANGEROUS_PATTERNS: &[(&str, &str, &str)] = &[
    (
        "rm -rf /",
        r"\brm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)\s+(?:-\S+\s+)*/\*?(?:[\s;&|]|$)",
        "This would destroy the entire system",
    ),
    (
        "mkfs",
        r"\bmkfs(?:\.[a-z0-9]+)?\b",
        "Formatting filesystems is blocked",
    ),
    (
        "dd if=/dev/zero",
        r"\bdd\s+(?:\S+\s+)*if=/dev/zero\b",
        "Direct disk operations are blocked",
    ),
    (
        "dd of=/dev/<disk>",
        r"\bdd\s+(?:\S+\s+)*of=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk)",
        "Direct disk operations are blocked",
    ),
    (
        ":(){:|:&};:",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "Fork bombs are blocked",
    ),
    (
        "chmod -R 777 /",
        r"\bchmod\s+(?:-\S+\s+)*-[a-z]*r[a-z]*\s+(?:-\S+\s+)*[0-7]{3,4}\s+/(?:[\s;&|]|$)",
        "Resetting permissions on the whole filesystem is blocked",
    ),
    (
        "chown -R /",
        r"\bchown\s+(?:-\S+\s+)*-[a-z]*r[a-z]*\s+(?:-\S+\s+)*\S+\s+/(?:[\s;&|]|$)",
        "Changing ownership of the whole filesystem is blocked",
    ),
    (
        "> /dev/<disk>",
        r">\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk)",
        "Writing to block devices is blocked",
    ),
];

fn compiled() -> &'static [(&'static str, Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DANGEROUS_PATTERNS
            .iter()
            .filter_map(|(name, pattern, reason)| match Regex::new(pattern) {
                Ok(re) => Some((*name, re, *reason)),
                Err(e) => {
                    tracing::error!("Invalid guard pattern {}: {}", name, e);
                    None
                }
            })
            .collect()
    })
}

/// Validate a command against the deny-list.
/// Returns `Ok(())` if allowed, `Err(SessionError::Rejected)` otherwise.
pub fn validate_command(command: &str) -> Result<(), SessionError> {
    let lowered = command.to_lowercase();
    for (name, re, reason) in compiled() {
        if re.is_match(&lowered) {
            return Err(SessionError::Rejected {
                pattern: *name,
                reason: *reason,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_destructive_commands() {
        for cmd in [
            "rm -rf /",
            "rm -rf /*",
            "sudo rm -fr / --no-preserve-root",
            "rm -r -f /",
            "cd /tmp && rm --recursive /",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "dd bs=4M of=/dev/nvme0n1 if=image.iso",
            ":(){ :|:& };:",
            "chmod -R 777 /",
            "chown -R nobody /",
            "cat junk > /dev/sda",
        ] {
            assert!(
                matches!(validate_command(cmd), Err(SessionError::Rejected { .. })),
                "expected {cmd:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_allows_ordinary_commands() {
        for cmd in [
            "echo hello",
            "rm -rf /tmp/build",
            "rm -rf ./target",
            "chmod -R 755 ./scripts",
            "chown -R me ./data",
            "ls / && echo done",
            "echo mkfs_is_a_word_here > notes.txt",
            "dd if=input.bin of=output.bin",
        ] {
            assert!(validate_command(cmd).is_ok(), "expected {cmd:?} to be allowed");
        }
    }
}
