use std::sync::Arc;

use regex::bytes::Captures;

use crate::catalog::{CompiledRule, ProbeCatalog};
use crate::records::ProductRecord;

/// Evaluates the catalog's rules against captured banners. Stateless apart
/// from the shared read-only catalog, so it is freely cloneable across the
/// pipeline.
#[derive(Clone)]
pub struct SignatureMatcher {
    catalog: Arc<ProbeCatalog>,
}

impl SignatureMatcher {
    pub fn new(catalog: Arc<ProbeCatalog>) -> Self {
        Self { catalog }
    }

    /// Run the rules declared for `probe_name` against one banner, in
    /// declaration order. A hard match ends evaluation for this probe; a
    /// softmatch is recorded and evaluation continues. Unknown probes and
    /// empty banners yield nothing.
    pub fn match_response(
        &self,
        scan_id: &str,
        probe_name: &str,
        banner: &[u8],
    ) -> Vec<ProductRecord> {
        let mut products = Vec::new();
        if banner.is_empty() {
            return products;
        }
        let Some(probe) = self.catalog.probe(probe_name) else {
            return products;
        };

        for rule in &probe.rules {
            if let Some(caps) = rule.regex.captures(banner) {
                products.push(product_from_rule(scan_id, probe_name, rule, &caps));
                if !rule.spec.softmatch {
                    break;
                }
            }
        }
        products
    }
}

fn product_from_rule(
    scan_id: &str,
    probe_name: &str,
    rule: &CompiledRule,
    caps: &Captures<'_>,
) -> ProductRecord {
    let spec = &rule.spec;
    ProductRecord {
        scan_id: scan_id.to_string(),
        probe: probe_name.to_string(),
        service: spec.service.clone(),
        regex: spec.pattern.clone(),
        softmatch: spec.softmatch,
        vendorproductname: spec.vendorproductname.as_deref().map(|t| expand(t, caps)),
        info: spec.info.as_deref().map(|t| expand(t, caps)),
        os: spec.os.as_deref().map(|t| expand(t, caps)),
        devicetype: spec.devicetype.as_deref().map(|t| expand(t, caps)),
        hostname: spec.hostname.as_deref().map(|t| expand(t, caps)),
        cpe: spec.cpe.iter().map(|t| expand(t, caps)).collect(),
    }
}

/// Substitute capture references (`$1`, `${1}`, `$$` for a literal `$`) in
/// a versioninfo template. Unmatched groups expand to the empty string; the
/// captured bytes are rendered lossily as UTF-8.
fn expand(template: &str, caps: &Captures<'_>) -> String {
    let mut out = Vec::with_capacity(template.len());
    caps.expand(template.as_bytes(), &mut out);
    String::from_utf8_lossy(&out).into_owned()
}
