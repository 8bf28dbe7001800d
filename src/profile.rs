use crate::error::{ResignError, Result};
use plist::{Dictionary, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const PLIST_START: &[u8] = b"<?xml";
const PLIST_END: &[u8] = b"</plist>";

pub const UDID_LEN: usize = 40;

/// A parsed `.mobileprovision`.
///
/// The outer CMS envelope is kept verbatim as `prefix` / `suffix` so that a
/// re-serialized profile differs from the input only in its plist payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningProfile {
    payload: Dictionary,
    entitlements: Dictionary,
    application_identifier: String,
    devices: Option<Vec<String>>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl ProvisioningProfile {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| {
            ResignError::ProfileParse(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let start = find(raw, PLIST_START, 0)
            .ok_or_else(|| ResignError::ProfileParse("no embedded plist found".to_string()))?;
        let end = find(raw, PLIST_END, start)
            .map(|i| i + PLIST_END.len())
            .ok_or_else(|| ResignError::ProfileParse("embedded plist is truncated".to_string()))?;

        let payload: Dictionary = plist::from_bytes(&raw[start..end])
            .map_err(|e| ResignError::ProfileParse(format!("embedded plist is invalid: {}", e)))?;

        let entitlements = payload
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .ok_or_else(|| ResignError::ProfileParse("profile has no Entitlements".to_string()))?;

        let application_identifier = entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
            .ok_or_else(|| {
                ResignError::ProfileParse("Entitlements lack application-identifier".to_string())
            })?
            .to_string();
        validate_application_identifier(&application_identifier)?;

        let devices = match payload.get("ProvisionedDevices") {
            None => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| {
                        v.as_string().map(str::to_string).ok_or_else(|| {
                            ResignError::ProfileParse(
                                "ProvisionedDevices holds a non-string".to_string(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(_) => {
                return Err(ResignError::ProfileParse(
                    "ProvisionedDevices is not an array".to_string(),
                ))
            }
        };

        Ok(Self {
            payload,
            entitlements,
            application_identifier,
            devices,
            prefix: raw[..start].to_vec(),
            suffix: raw[end..].to_vec(),
        })
    }

    pub fn application_identifier(&self) -> &str {
        &self.application_identifier
    }

    /// Application identifier without its leading team-id segment.
    pub fn bundle_id(&self) -> &str {
        self.application_identifier
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.application_identifier)
    }

    pub fn team_id(&self) -> &str {
        self.application_identifier
            .split_once('.')
            .map(|(team, _)| team)
            .unwrap_or_default()
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    pub fn devices(&self) -> Option<&[String]> {
        self.devices.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.payload.get("Name").and_then(Value::as_string)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.payload.get("UUID").and_then(Value::as_string)
    }

    pub fn expiration_date(&self) -> Option<plist::Date> {
        self.payload.get("ExpirationDate").and_then(Value::as_date)
    }

    /// Whether a `*` wildcard identifier authorizes any bundle id.
    pub fn is_wildcard(&self) -> bool {
        self.bundle_id() == "*" || self.bundle_id().ends_with(".*")
    }

    /// New profile whose device list is the union of the current one and
    /// `udids`. Already present identifiers are not duplicated.
    pub fn with_devices<S: AsRef<str>>(&self, udids: &[S]) -> Self {
        let mut devices = self.devices.clone().unwrap_or_default();
        let mut seen: HashSet<String> = devices.iter().map(|d| d.to_ascii_lowercase()).collect();

        for udid in udids {
            let udid = udid.as_ref();
            if seen.insert(udid.to_ascii_lowercase()) {
                devices.push(udid.to_string());
            }
        }

        let mut payload = self.payload.clone();
        payload.insert(
            "ProvisionedDevices".to_string(),
            Value::Array(devices.iter().cloned().map(Value::String).collect()),
        );

        Self {
            payload,
            entitlements: self.entitlements.clone(),
            application_identifier: self.application_identifier.clone(),
            devices: Some(devices),
            prefix: self.prefix.clone(),
            suffix: self.suffix.clone(),
        }
    }

    /// Serialize back into the original envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &self.payload)
            .map_err(|e| ResignError::ProfileParse(format!("serializing profile: {}", e)))?;

        let mut out = Vec::with_capacity(self.prefix.len() + body.len() + self.suffix.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&body);
        out.extend_from_slice(&self.suffix);
        Ok(out)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_bytes()?).map_err(|e| {
            ResignError::ProfileParse(format!("cannot write {}: {}", path.display(), e))
        })
    }

    pub fn entitlements_xml(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &self.entitlements)
            .map_err(|e| ResignError::ProfileParse(format!("serializing entitlements: {}", e)))?;
        Ok(out)
    }
}

fn validate_application_identifier(id: &str) -> Result<()> {
    match id.split_once('.') {
        Some((team, rest)) if !team.is_empty() && !rest.is_empty() => Ok(()),
        _ => Err(ResignError::ProfileParse(format!(
            "application-identifier \"{}\" has no team-id prefix",
            id
        ))),
    }
}

/// Accepts exactly 40 hexadecimal characters.
pub fn validate_udid(udid: &str) -> Result<()> {
    if udid.len() != UDID_LEN {
        return Err(ResignError::InputValidation(format!(
            "device id \"{}\" must be {} characters, got {}",
            udid,
            UDID_LEN,
            udid.len()
        )));
    }
    if !udid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ResignError::InputValidation(format!(
            "device id \"{}\" must be hex characters only",
            udid
        )));
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
