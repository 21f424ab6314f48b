//! The access-control and method-routing policy.
//!
//! A [`Policy`] is an immutable snapshot built from a declarative policy
//! file.  The running broker holds the current snapshot behind an
//! `RwLock<Arc<Policy>>`; a reload builds a whole new snapshot and swaps it
//! in, so in-flight calls keep seeing the policy they started under.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

/// Maximum depth of transitive `+name` ACL inclusion.
const MAX_ACL_DEPTH: usize = 10;

/// The distinguished ACL name that every principal belongs to.
pub const PUBLIC_ACL: &str = "public";

/// The namespace reserved for the switch's own methods.
pub(crate) const RESERVED_NS: &str = "rpcswitch";

/// An error from loading or resolving a policy file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// Could not read the policy file.
    #[error("could not read policy file")]
    Io(#[from] std::io::Error),

    /// The policy file was not valid TOML of the right shape.
    #[error("could not parse policy file")]
    Parse(#[from] toml::de::Error),

    /// An ACL inclusion named an ACL that does not exist.
    #[error("acl {from} includes unknown acl {acl}")]
    UnknownInclusion {
        /// The ACL doing the including.
        from: String,
        /// The missing ACL.
        acl: String,
    },

    /// ACL inclusion recursed deeper than [`MAX_ACL_DEPTH`] levels.
    ///
    /// Inclusion cycles always end up here.
    #[error("acl {0} exceeds the inclusion depth limit")]
    TooDeep(String),

    /// A method or backend ACL mapping referenced an undefined ACL.
    #[error("{key} references unknown acl {acl}")]
    UnknownAclRef {
        /// The method2acl/backend2acl key holding the reference.
        key: String,
        /// The missing ACL.
        acl: String,
    },

    /// A method or backend name was not in `ns.name` form.
    #[error("bad method or backend name: {0}")]
    BadName(String),

    /// A method or backend used the switch's reserved namespace.
    #[error("{0} is in the reserved namespace")]
    ReservedNamespace(String),
}

/// One ACL reference: a single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AclSpec {
    /// A single ACL name.
    One(String),
    /// Any of several ACL names.
    Many(Vec<String>),
}

impl AclSpec {
    /// Flatten into a list of names.
    fn into_names(self) -> Vec<String> {
        match self {
            AclSpec::One(name) => vec![name],
            AclSpec::Many(names) => names,
        }
    }
}

/// One entry of the `methods` table as written in the policy file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MethodSpec {
    /// Shorthand: a backend prefix ending in `.`, to which the short method
    /// name is appended, or a complete backend name.
    Backend(String),
    /// The full record form.
    Full {
        /// The backend the method maps to.
        backend: String,
        /// Optional human-readable documentation.
        doc: Option<String>,
    },
}

/// The policy file as parsed, before resolution.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    /// ACL name to member list; members starting with `+` include another
    /// ACL transitively.
    #[serde(default)]
    pub acl: BTreeMap<String, Vec<String>>,
    /// Method name or `ns.*` wildcard to the ACL(s) allowed to call it.
    #[serde(default)]
    pub method2acl: BTreeMap<String, AclSpec>,
    /// Backend name or `ns.*` wildcard to the ACL(s) allowed to announce it.
    #[serde(default)]
    pub backend2acl: BTreeMap<String, AclSpec>,
    /// Backend name or `ns.*` wildcard to the single filter key that calls
    /// and announcements must carry.
    #[serde(default)]
    pub backendfilter: BTreeMap<String, String>,
    /// Public method name to its backend mapping.
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,
}

/// One resolved entry of the method table.
#[derive(Debug)]
pub struct MethodEntry {
    /// The backend that calls to this method are routed to.
    pub backend: String,
    /// Optional documentation string, surfaced by introspection.
    pub doc: Option<String>,
    /// How many calls have been dispatched through this entry.
    calls: AtomicU64,
}

impl MethodEntry {
    /// Count one dispatched call.
    pub(crate) fn bump_calls(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of calls dispatched through this entry so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// An immutable, fully resolved policy snapshot.
#[derive(Debug, Default)]
pub struct Policy {
    /// Resolved ACL membership (inclusions flattened).
    acl: HashMap<String, HashSet<String>>,
    /// Inverted form: user to the set of ACLs naming them.
    who2acl: HashMap<String, HashSet<String>>,
    /// Method (or `ns.*`) to allowed caller ACLs.
    method2acl: HashMap<String, Vec<String>>,
    /// Backend (or `ns.*`) to allowed announcer ACLs.
    backend2acl: HashMap<String, Vec<String>>,
    /// Backend (or `ns.*`) to required filter key.
    backendfilter: HashMap<String, String>,
    /// Public method table.
    methods: HashMap<String, MethodEntry>,
}

/// Split `name` into its namespace and local part.
///
/// Returns `None` unless both parts are nonempty.
pub(crate) fn split_ns(name: &str) -> Option<(&str, &str)> {
    match name.split_once('.') {
        Some((ns, local)) if !ns.is_empty() && !local.is_empty() => Some((ns, local)),
        _ => None,
    }
}

/// The `ns.*` wildcard covering `name`, if `name` has a namespace.
fn wildcard_of(name: &str) -> Option<String> {
    split_ns(name).map(|(ns, _)| format!("{}.*", ns))
}

/// Check that `name` is usable as a policy key: either `ns.name` or `ns.*`.
fn check_key(name: &str) -> Result<(), PolicyError> {
    match split_ns(name) {
        Some((ns, _)) if ns == RESERVED_NS => Err(PolicyError::ReservedNamespace(name.to_owned())),
        Some(_) => Ok(()),
        None => Err(PolicyError::BadName(name.to_owned())),
    }
}

impl Policy {
    /// Load and resolve a policy from a TOML string.
    pub fn load_str(text: &str) -> Result<Policy, PolicyError> {
        let file: PolicyFile = toml::from_str(text)?;
        Policy::resolve(file)
    }

    /// Load and resolve a policy from a file on disk.
    pub fn load_path(path: &Path) -> Result<Policy, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        Policy::load_str(&text)
    }

    /// Resolve a parsed [`PolicyFile`] into a snapshot.
    pub fn resolve(file: PolicyFile) -> Result<Policy, PolicyError> {
        let mut acl = HashMap::new();
        for name in file.acl.keys() {
            acl.insert(name.clone(), expand_acl(name, &file.acl, 0)?);
        }

        let mut who2acl: HashMap<String, HashSet<String>> = HashMap::new();
        for (name, members) in &acl {
            for member in members {
                who2acl
                    .entry(member.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let method2acl = resolve_acl_map(file.method2acl, &acl)?;
        let backend2acl = resolve_acl_map(file.backend2acl, &acl)?;

        let mut backendfilter = HashMap::new();
        for (key, field) in file.backendfilter {
            check_key(&key)?;
            backendfilter.insert(key, field);
        }

        let mut methods = HashMap::new();
        for (name, spec) in file.methods {
            let (_, local) = split_ns(&name).ok_or_else(|| PolicyError::BadName(name.clone()))?;
            check_key(&name)?;
            if local == "*" {
                // The method table is looked up by exact name only.
                return Err(PolicyError::BadName(name));
            }
            let (backend, doc) = match spec {
                MethodSpec::Backend(b) if b.ends_with('.') => (format!("{}{}", b, local), None),
                MethodSpec::Backend(b) => (b, None),
                MethodSpec::Full { backend, doc } => (backend, doc),
            };
            check_key(&backend)?;
            methods.insert(
                name,
                MethodEntry {
                    backend,
                    doc,
                    calls: AtomicU64::new(0),
                },
            );
        }

        Ok(Policy {
            acl,
            who2acl,
            method2acl,
            backend2acl,
            backendfilter,
            methods,
        })
    }

    /// Return true iff `who` is in any of the ACLs named by `spec`.
    ///
    /// The `public` ACL matches everyone, including principals the policy
    /// has never heard of.
    pub fn check_acl(&self, spec: &[String], who: &str) -> bool {
        spec.iter().any(|name| {
            name == PUBLIC_ACL
                || self
                    .who2acl
                    .get(who)
                    .is_some_and(|acls| acls.contains(name))
        })
    }

    /// The ACLs allowed to call `method`: an exact entry wins, else the
    /// `ns.*` wildcard.
    pub fn acl_for_method(&self, method: &str) -> Option<&[String]> {
        lookup_with_wildcard(&self.method2acl, method).map(Vec::as_slice)
    }

    /// The ACLs allowed to announce `backend`, with the same lookup rule.
    pub fn acl_for_backend(&self, backend: &str) -> Option<&[String]> {
        lookup_with_wildcard(&self.backend2acl, backend).map(Vec::as_slice)
    }

    /// The filter key required for `backend`, with the same lookup rule.
    pub fn filter_for_backend(&self, backend: &str) -> Option<&str> {
        lookup_with_wildcard(&self.backendfilter, backend).map(String::as_str)
    }

    /// Look up a public method.
    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    /// Iterate over the whole public method table.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodEntry)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The resolved member set of an ACL, mostly for diagnostics.
    pub fn acl_members(&self, name: &str) -> Option<&HashSet<String>> {
        self.acl.get(name)
    }
}

/// Exact-then-wildcard lookup shared by the three policy maps.
fn lookup_with_wildcard<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name)
        .or_else(|| wildcard_of(name).and_then(|w| map.get(&w)))
}

/// Flatten the membership of one ACL, following `+name` inclusions.
fn expand_acl(
    name: &str,
    raw: &BTreeMap<String, Vec<String>>,
    depth: usize,
) -> Result<HashSet<String>, PolicyError> {
    if depth > MAX_ACL_DEPTH {
        return Err(PolicyError::TooDeep(name.to_owned()));
    }
    let mut out = HashSet::new();
    for member in raw.get(name).map(Vec::as_slice).unwrap_or_default() {
        match member.strip_prefix('+') {
            Some(included) => {
                if !raw.contains_key(included) {
                    return Err(PolicyError::UnknownInclusion {
                        from: name.to_owned(),
                        acl: included.to_owned(),
                    });
                }
                out.extend(expand_acl(included, raw, depth + 1)?);
            }
            None => {
                out.insert(member.clone());
            }
        }
    }
    Ok(out)
}

/// Resolve a `method2acl`/`backend2acl` table, checking every referenced
/// ACL exists.
fn resolve_acl_map(
    input: BTreeMap<String, AclSpec>,
    acl: &HashMap<String, HashSet<String>>,
) -> Result<HashMap<String, Vec<String>>, PolicyError> {
    let mut out = HashMap::new();
    for (key, spec) in input {
        check_key(&key)?;
        let names = spec.into_names();
        for name in &names {
            if name != PUBLIC_ACL && !acl.contains_key(name) {
                return Err(PolicyError::UnknownAclRef {
                    key: key.clone(),
                    acl: name.clone(),
                });
            }
        }
        out.insert(key, names);
    }
    Ok(out)
}
