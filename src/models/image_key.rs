use serde::{Deserialize, Serialize};

/// Natural key embedded in the source filename convention:
/// `…/{eid}_{cid}_{photonum}_tn_{n}.{ext}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub eid: i64,
    pub cid: i64,
    pub photonum: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("image key {key:?} does not match the eid_cid_photonum_tn_* convention")]
pub struct KeyParseError {
    pub key: String,
}

const IMAGE_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// Whether a listed object key names a recognized image file.
pub fn is_image_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Parse `(eid, cid, photonum)` from an object key.
///
/// The basename is split on the `_tn_` thumbnail marker; the leading part
/// must be exactly three underscore-separated integers.
pub fn parse_natural_key(key: &str) -> Result<NaturalKey, KeyParseError> {
    let err = || KeyParseError {
        key: key.to_string(),
    };

    let basename = key.rsplit('/').next().ok_or_else(err)?;
    let stem = basename.split("_tn_").next().ok_or_else(err)?;

    let mut parts = stem.split('_');
    let eid = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let cid = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let photonum = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    if parts.next().is_some() {
        return Err(err());
    }

    Ok(NaturalKey { eid, cid, photonum })
}
