use std::collections::BTreeMap;

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

/// Hash tuple attached to every captured banner. Serializes as the 3-tuple
/// `(md5, sha256, simhash)` expected by the `banners_hashes` map column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerHashes {
    pub md5: String,
    pub sha256: String,
    pub simhash: u64,
}

impl Serialize for BannerHashes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.md5)?;
        tup.serialize_element(&self.sha256)?;
        tup.serialize_element(&self.simhash)?;
        tup.end()
    }
}

fn bool_as_u8<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

/// One row of `scans.scan_results`; one per (ip, port) attempt, including
/// attempts that never produced a banner.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(serialize_with = "bool_as_u8")]
    pub ssl_tls: bool,
    pub used_probes: BTreeMap<String, String>,
    pub scan_tries: u32,
    pub sended_probes: u32,
    pub banners: BTreeMap<String, String>,
    pub timestamp: i64,
    pub total_time_spent: String,
    pub hex_banners: BTreeMap<String, String>,
    pub banners_hashes: BTreeMap<String, BannerHashes>,
    pub products_count: u64,
    pub product_services: Vec<String>,
}

impl ScanRecord {
    /// scan_id groups a result with its product rows. It is unique per
    /// target attempt: `{ip}_{port}_{timestamp}`.
    pub fn make_scan_id(ip: &str, port: u16, timestamp: i64) -> String {
        format!("{}_{}_{}", ip, port, timestamp)
    }

    /// Fill the product summary columns from the rows matched for this scan.
    pub fn attach_product_summary(&mut self, products: &[ProductRecord]) {
        self.products_count = products.len() as u64;
        self.product_services.clear();
        for product in products {
            if !product.service.is_empty() && !self.product_services.contains(&product.service) {
                self.product_services.push(product.service.clone());
            }
        }
    }
}

/// One row of `scans.products`, produced only by the signature matcher.
#[derive(Debug, Clone, Serialize)]
pub struct ProductRecord {
    pub scan_id: String,
    pub probe: String,
    pub service: String,
    pub regex: String,
    #[serde(serialize_with = "bool_as_u8")]
    pub softmatch: bool,
    pub vendorproductname: Option<String>,
    pub info: Option<String>,
    pub os: Option<String>,
    pub devicetype: Option<String>,
    pub hostname: Option<String>,
    pub cpe: Vec<String>,
}

/// Decode a raw response into the `banners` text field. Returns `None` when
/// the payload is not valid UTF-8 or is dominated by non-printable bytes, in
/// which case only the hex form is kept.
pub fn decode_banner(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    if text.is_empty() {
        return None;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(*c, '\r' | '\n' | '\t'))
        .count();
    if printable * 10 < text.chars().count() * 9 {
        return None;
    }
    Some(text.to_string())
}

/// Truncated lossy rendering stored in `used_probes`, capped so a chatty
/// service cannot bloat a row.
pub fn truncate_response(raw: &[u8], cap: usize) -> String {
    let end = raw.len().min(cap);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
