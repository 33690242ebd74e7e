//! Device credentials and the XML data file they live in
//!
//! Account data files are Android shared-preferences documents:
//!
//! ```xml
//! <?xml version='1.0' encoding='utf-8' standalone='yes' ?>
//! <map>
//!     <string name="deviceAccount">abc123</string>
//!     <string name="devicePassword">s3cret</string>
//! </map>
//! ```
//!
//! Only the two `<string>` entries matter here; any other entries are ignored
//! on parse and not reproduced on render.

use common::Secret;

use crate::error::{Error, Result};

const ACCOUNT_KEY: &str = "deviceAccount";
const PASSWORD_KEY: &str = "devicePassword";

/// Credentials needed to materialize an account's data file.
#[derive(Debug, Clone)]
pub struct DeviceCredential {
    pub device_account: String,
    pub device_password: Secret<String>,
}

/// Parse a device data file.
pub fn parse_device_file(contents: &str) -> Result<DeviceCredential> {
    let device_account = string_entry(contents, ACCOUNT_KEY)
        .ok_or_else(|| Error::Parse(format!("missing {ACCOUNT_KEY} entry")))?;
    let device_password = string_entry(contents, PASSWORD_KEY)
        .ok_or_else(|| Error::Parse(format!("missing {PASSWORD_KEY} entry")))?;
    if device_account.is_empty() {
        return Err(Error::Parse(format!("empty {ACCOUNT_KEY} entry")));
    }
    Ok(DeviceCredential {
        device_account,
        device_password: Secret::new(device_password),
    })
}

/// Render the minimal data file for a credential.
pub fn render_device_file(credential: &DeviceCredential) -> String {
    format!(
        "<?xml version='1.0' encoding='utf-8' standalone='yes' ?>\n<map>\n    \
         <string name=\"{ACCOUNT_KEY}\">{}</string>\n    \
         <string name=\"{PASSWORD_KEY}\">{}</string>\n</map>\n",
        escape(&credential.device_account),
        escape(credential.device_password.expose()),
    )
}

/// Find `<string name="key">value</string>`, accepting either quote style.
fn string_entry(contents: &str, key: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let open = format!("<string name={quote}{key}{quote}>");
        if let Some(start) = contents.find(&open) {
            let rest = &contents[start + open.len()..];
            let end = rest.find("</string>")?;
            return Some(unescape(rest[..end].trim()));
        }
    }
    None
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
