//! Postfix `main.cf` editing
//!
//! Parameters are `name = value` lines; a line starting with whitespace
//! continues the previous parameter.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{CertError, Result};

/// Main.cf key for the server certificate chain
pub const CERT_FILE_KEY: &str = "smtpd_tls_cert_file";
/// Main.cf key for the server private key
pub const KEY_FILE_KEY: &str = "smtpd_tls_key_file";

/// Set the given parameters in `main.cf`, creating the file if needed.
///
/// Existing assignments (with their continuation lines) are replaced in
/// place, later duplicates are dropped and missing keys are appended.
/// Returns whether the file changed.
pub fn set_parameters(path: &Path, params: &[(&str, &str)]) -> Result<bool> {
    let current = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(CertError::Deployment(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let updated = apply_parameters(&current, params);
    if updated == current {
        debug!(path = ?path, "main.cf already up to date");
        return Ok(false);
    }

    write_atomically(path, &updated)?;
    info!(path = ?path, keys = ?params.iter().map(|(k, _)| *k).collect::<Vec<_>>(), "Updated main.cf");
    Ok(true)
}

/// Pure rewrite of main.cf content
pub fn apply_parameters(content: &str, params: &[(&str, &str)]) -> String {
    let mut written = vec![false; params.len()];
    let mut out: Vec<String> = Vec::new();
    let mut skipping_continuation = false;

    for line in content.lines() {
        let continues = line.starts_with([' ', '\t']) && !line.trim().is_empty();
        if skipping_continuation && continues {
            continue;
        }
        skipping_continuation = false;

        match parameter_name(line).and_then(|name| params.iter().position(|(k, _)| *k == name)) {
            Some(index) => {
                if !written[index] {
                    let (key, value) = params[index];
                    out.push(format!("{} = {}", key, value));
                    written[index] = true;
                }
                skipping_continuation = true;
            }
            None => out.push(line.to_string()),
        }
    }

    for (index, (key, value)) in params.iter().enumerate() {
        if !written[index] {
            out.push(format!("{} = {}", key, value));
        }
    }

    let mut result = out.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

/// Name assigned on a logical-line start, if any
fn parameter_name(line: &str) -> Option<&str> {
    if line.starts_with([' ', '\t', '#']) {
        return None;
    }
    let (name, _) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name)
}

fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                CertError::Deployment(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }

    let tmp = path.with_extension("cf.mailcert-tmp");
    fs::write(&tmp, content).map_err(|e| {
        CertError::Deployment(format!("Failed to write {}: {}", tmp.display(), e))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        CertError::Deployment(format!("Failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}
