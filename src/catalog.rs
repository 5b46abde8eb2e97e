use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use regex::bytes::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::warn;

/// One signature rule as declared in the catalog. Patterns follow the
/// nmap-probes versioninfo convention: capture groups referenced as `$1..$9`
/// inside the template fields.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub service: String,
    pub pattern: String,
    #[serde(default)]
    pub softmatch: bool,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub vendorproductname: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub devicetype: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub cpe: Vec<String>,
}

/// A rule whose pattern compiled successfully. Matching is binary-safe:
/// banners are never assumed to be valid text.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub spec: RuleSpec,
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub protocol: String,
    pub payload: Vec<u8>,
    /// Ports this probe has affinity for; empty means generic fallback.
    pub ports: Vec<u16>,
    /// Lower rarity probes are tried first, as in nmap-service-probes.
    pub rarity: u8,
    pub rules: Vec<CompiledRule>,
}

impl ProbeSpec {
    pub fn hints_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Read-only probe corpus shared by all workers. Loaded once; rules with
/// unparseable patterns are dropped at load time with a warning.
#[derive(Debug)]
pub struct ProbeCatalog {
    probes: Vec<ProbeSpec>,
    by_name: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct CatalogFile {
    probes: Vec<ProbeEntry>,
}

#[derive(Deserialize)]
struct ProbeEntry {
    name: String,
    #[serde(default = "default_protocol")]
    protocol: String,
    /// Base64-encoded payload; probes whose payload is empty listen only.
    #[serde(default)]
    payload: String,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default = "default_rarity")]
    rarity: u8,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_rarity() -> u8 {
    5
}

impl ProbeCatalog {
    /// Load from a JSON catalog file, or fall back to the built-in corpus.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read probe catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid probe catalog {}", path.display()))?;

        let mut probes = Vec::with_capacity(file.probes.len());
        for entry in file.probes {
            let payload = if entry.payload.is_empty() {
                Vec::new()
            } else {
                general_purpose::STANDARD
                    .decode(&entry.payload)
                    .with_context(|| format!("probe {}: payload is not valid base64", entry.name))?
            };
            probes.push(build_probe(
                entry.name,
                entry.protocol,
                payload,
                entry.ports,
                entry.rarity,
                entry.rules,
            ));
        }
        Ok(Self::from_probes(probes))
    }

    pub fn from_probes(probes: Vec<ProbeSpec>) -> Self {
        let by_name = probes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self { probes, by_name }
    }

    pub fn probes(&self) -> &[ProbeSpec] {
        &self.probes
    }

    pub fn probe(&self, name: &str) -> Option<&ProbeSpec> {
        self.by_name.get(name).map(|&i| &self.probes[i])
    }

    /// Probes applicable to a target port, most specific first: port-hinted
    /// probes ordered by rarity, then generic probes ordered by rarity.
    pub fn probes_for(&self, port: u16) -> Vec<&ProbeSpec> {
        let mut hinted: Vec<&ProbeSpec> =
            self.probes.iter().filter(|p| p.hints_port(port)).collect();
        let mut generic: Vec<&ProbeSpec> =
            self.probes.iter().filter(|p| p.ports.is_empty()).collect();
        hinted.sort_by_key(|p| p.rarity);
        generic.sort_by_key(|p| p.rarity);
        hinted.extend(generic);
        hinted
    }

    /// Built-in corpus covering the protocols most often seen on exposed
    /// hosts. A deployment-sized corpus is expected to come from `--probes`.
    pub fn builtin() -> Self {
        let probes = vec![
            build_probe(
                "NullProbe".into(),
                "tcp".into(),
                Vec::new(),
                Vec::new(),
                1,
                vec![
                    rule("ssh", r"^SSH-([\d.]+)-OpenSSH[_-]([^\s\r\n]+)", |r| {
                        r.vendorproductname = Some("OpenSSH".into());
                        r.info = Some("$2".into());
                        r.cpe = vec!["cpe:/a:openbsd:openssh:$2".into()];
                    }),
                    rule("ssh", r"^SSH-([\d.]+)-", |r| {
                        r.softmatch = true;
                        r.info = Some("protocol $1".into());
                    }),
                    rule("ftp", r"^220 \(vsFTPd ([\d.]+)\)", |r| {
                        r.vendorproductname = Some("vsftpd".into());
                        r.info = Some("$1".into());
                        r.cpe = vec!["cpe:/a:vsftpd:vsftpd:$1".into()];
                    }),
                    rule("ftp", r"^220 ProFTPD ([\d.]+\S*)", |r| {
                        r.vendorproductname = Some("ProFTPD".into());
                        r.info = Some("$1".into());
                        r.cpe = vec!["cpe:/a:proftpd:proftpd:$1".into()];
                    }),
                    rule("ftp", r"^220[ -][^\r\n]*FTP", |r| {
                        r.softmatch = true;
                        r.case_insensitive = true;
                    }),
                    rule("smtp", r"^220[ -]([^\s]+) ESMTP Postfix", |r| {
                        r.vendorproductname = Some("Postfix smtpd".into());
                        r.hostname = Some("$1".into());
                        r.cpe = vec!["cpe:/a:postfix:postfix".into()];
                    }),
                    rule("smtp", r"^220[ -][^\r\n]*SMTP", |r| {
                        r.softmatch = true;
                        r.case_insensitive = true;
                    }),
                    rule("mysql", r"^.\x00\x00\x00\x0a([\d.]+)", |r| {
                        r.vendorproductname = Some("MySQL".into());
                        r.info = Some("$1".into());
                        r.cpe = vec!["cpe:/a:mysql:mysql:$1".into()];
                    }),
                ],
            ),
            build_probe(
                "GetRequest".into(),
                "tcp".into(),
                b"GET / HTTP/1.0\r\n\r\n".to_vec(),
                vec![80, 443, 8000, 8080, 8443],
                1,
                vec![
                    rule("http", r"Server: nginx/?([\d.]*)", |r| {
                        r.vendorproductname = Some("nginx".into());
                        r.info = Some("$1".into());
                        r.cpe = vec!["cpe:/a:nginx:nginx:$1".into()];
                    }),
                    rule("http", r"Server: Apache/?([\d.]*)", |r| {
                        r.vendorproductname = Some("Apache httpd".into());
                        r.info = Some("$1".into());
                        r.cpe = vec!["cpe:/a:apache:http_server:$1".into()];
                    }),
                    rule("http", r"Server: Microsoft-IIS/([\d.]+)", |r| {
                        r.vendorproductname = Some("Microsoft IIS httpd".into());
                        r.info = Some("$1".into());
                        r.os = Some("Windows".into());
                        r.cpe = vec![
                            "cpe:/a:microsoft:internet_information_services:$1".into(),
                            "cpe:/o:microsoft:windows".into(),
                        ];
                    }),
                    rule("http", r"^HTTP/1\.[01] \d\d\d", |r| {
                        r.softmatch = true;
                    }),
                ],
            ),
            build_probe(
                "GenericLines".into(),
                "tcp".into(),
                b"\r\n\r\n".to_vec(),
                Vec::new(),
                9,
                vec![
                    rule("ftp", r"^220[ -][^\r\n]*FTP", |r| {
                        r.softmatch = true;
                        r.case_insensitive = true;
                    }),
                    rule("smtp", r"^220[ -][^\r\n]*SMTP", |r| {
                        r.softmatch = true;
                        r.case_insensitive = true;
                    }),
                ],
            ),
            build_probe(
                "RedisInfo".into(),
                "tcp".into(),
                b"*1\r\n$4\r\nINFO\r\n".to_vec(),
                vec![6379],
                5,
                vec![rule("redis", r"redis_version:([\d.]+)", |r| {
                    r.vendorproductname = Some("Redis key-value store".into());
                    r.info = Some("$1".into());
                    r.cpe = vec!["cpe:/a:redislabs:redis:$1".into()];
                })],
            ),
        ];
        Self::from_probes(probes)
    }
}

fn rule(service: &str, pattern: &str, configure: impl FnOnce(&mut RuleSpec)) -> RuleSpec {
    let mut spec = RuleSpec {
        service: service.to_string(),
        pattern: pattern.to_string(),
        softmatch: false,
        case_insensitive: false,
        vendorproductname: None,
        info: None,
        os: None,
        devicetype: None,
        hostname: None,
        cpe: Vec::new(),
    };
    configure(&mut spec);
    spec
}

fn build_probe(
    name: String,
    protocol: String,
    payload: Vec<u8>,
    ports: Vec<u16>,
    rarity: u8,
    rules: Vec<RuleSpec>,
) -> ProbeSpec {
    let compiled = rules
        .into_iter()
        .filter_map(|spec| match compile_rule(&spec) {
            Ok(regex) => Some(CompiledRule { spec, regex }),
            Err(err) => {
                warn!(probe = %name, service = %spec.service, pattern = %spec.pattern,
                      "skipping signature rule with invalid pattern: {err}");
                None
            }
        })
        .collect();
    ProbeSpec {
        name,
        protocol,
        payload,
        ports,
        rarity,
        rules: compiled,
    }
}

fn compile_rule(spec: &RuleSpec) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(&spec.pattern)
        .case_insensitive(spec.case_insensitive)
        .unicode(false)
        .build()
}
