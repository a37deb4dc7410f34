//! Permission catalog: the fixed registry of permission identifiers.
//!
//! Every permission has a resource level (from the organization down to a
//! single service or app deployment of a target), a display group and a list of
//! permissions it implies. The implication closure is computed once when the
//! catalog is first touched; `expand` is then a plain lookup per permission.
//!
//! Unknown identifiers are rejected when a grant is created (`parse_all`), so the
//! rest of the engine only ever handles `Permission` values that exist here.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Resource level a permission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Organization,
    Project,
    Target,
    Service,
    AppDeployment,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Organization,
        Level::Project,
        Level::Target,
        Level::Service,
        Level::AppDeployment,
    ];
}

struct PermissionDef {
    id: &'static str,
    title: &'static str,
    group: &'static str,
    level: Level,
    implies: &'static [&'static str],
}

const fn def(
    id: &'static str,
    title: &'static str,
    group: &'static str,
    level: Level,
    implies: &'static [&'static str],
) -> PermissionDef {
    PermissionDef {
        id,
        title,
        group,
        level,
        implies,
    }
}

// Order matters: it is the display order of resolved permission groups.
#[rustfmt::skip]
static DEFINITIONS: &[PermissionDef] = &[
    // ── Organization ─────────────────────────────────────────
    def("organization:describe", "Describe organization", "Organization", Level::Organization, &[]),
    def("organization:modifySlug", "Modify organization slug", "Organization", Level::Organization, &["organization:describe"]),
    def("organization:delete", "Delete organization", "Organization", Level::Organization, &["organization:describe"]),
    def("support:manageTickets", "Manage support tickets", "Organization", Level::Organization, &[]),
    def("billing:describe", "Describe billing", "Billing", Level::Organization, &[]),
    def("billing:update", "Update billing", "Billing", Level::Organization, &["billing:describe"]),
    def("member:describe", "Describe members", "Members", Level::Organization, &[]),
    def("member:manageInvites", "Manage invites", "Members", Level::Organization, &["member:describe"]),
    def("member:removeMember", "Remove members", "Members", Level::Organization, &["member:describe"]),
    def("member:assignRole", "Assign member roles", "Members", Level::Organization, &["member:describe"]),
    def("member:modifyRole", "Modify member roles", "Members", Level::Organization, &["member:describe"]),
    def("oidc:modify", "Manage OIDC integration", "Integrations", Level::Organization, &[]),
    def("gitHubIntegration:modify", "Manage GitHub integration", "Integrations", Level::Organization, &[]),
    def("slackIntegration:modify", "Manage Slack integration", "Integrations", Level::Organization, &[]),
    def("schemaLinting:modifyOrganizationRules", "Modify organization linting rules", "Organization", Level::Organization, &[]),
    def("auditLog:export", "Export audit logs", "Organization", Level::Organization, &[]),
    def("accessToken:modify", "Manage organization access tokens", "Access Tokens", Level::Organization, &[]),
    def("personalAccessToken:modify", "Manage personal access tokens", "Access Tokens", Level::Organization, &[]),
    def("project:create", "Create projects", "Organization", Level::Organization, &[]),
    // ── Project ──────────────────────────────────────────────
    def("project:describe", "Describe project", "Project", Level::Project, &[]),
    def("project:delete", "Delete project", "Project", Level::Project, &["project:describe"]),
    def("project:modifySettings", "Modify project settings", "Project", Level::Project, &["project:describe"]),
    def("schemaLinting:modifyProjectRules", "Modify project linting rules", "Project", Level::Project, &["project:describe"]),
    def("alert:modify", "Manage alerts", "Project", Level::Project, &["project:describe"]),
    def("projectAccessToken:modify", "Manage project access tokens", "Access Tokens", Level::Project, &["project:describe"]),
    def("target:create", "Create targets", "Project", Level::Project, &["project:describe"]),
    // ── Target ───────────────────────────────────────────────
    def("target:modifySettings", "Modify target settings", "Target", Level::Target, &[]),
    def("target:delete", "Delete target", "Target", Level::Target, &[]),
    def("targetAccessToken:modify", "Manage target access tokens", "Access Tokens", Level::Target, &[]),
    def("cdnAccessToken:modify", "Manage CDN access tokens", "Access Tokens", Level::Target, &[]),
    def("laboratory:describe", "Describe laboratory", "Laboratory", Level::Target, &[]),
    def("laboratory:modify", "Modify laboratory", "Laboratory", Level::Target, &["laboratory:describe"]),
    def("laboratory:modifyPreflightScript", "Modify preflight script", "Laboratory", Level::Target, &["laboratory:modify"]),
    def("appDeployment:describe", "Describe app deployments", "App Deployments", Level::Target, &[]),
    def("appDeployment:create", "Create app deployments", "App Deployments", Level::AppDeployment, &["appDeployment:describe"]),
    def("appDeployment:publish", "Publish app deployments", "App Deployments", Level::AppDeployment, &["appDeployment:create"]),
    def("appDeployment:retire", "Retire app deployments", "App Deployments", Level::AppDeployment, &["appDeployment:describe"]),
    def("schemaCheck:create", "Run schema checks", "Schema Registry", Level::Service, &[]),
    def("schemaCheck:approve", "Approve schema checks", "Schema Registry", Level::Service, &["schemaCheck:create"]),
    def("schemaVersion:publish", "Publish schema versions", "Schema Registry", Level::Service, &["schemaCheck:create"]),
    def("schemaProposal:describe", "Describe schema proposals", "Schema Registry", Level::Target, &[]),
    def("schemaProposal:modify", "Modify schema proposals", "Schema Registry", Level::Target, &["schemaProposal:describe"]),
    def("usage:report", "Report usage data", "Usage Reporting", Level::Target, &[]),
    def("traces:report", "Report traces", "Usage Reporting", Level::Target, &[]),
];

/// A permission from the catalog.
///
/// Ordering follows catalog order, so sets of permissions iterate in the same
/// order they are displayed in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permission(u16);

impl Permission {
    fn def(self) -> &'static PermissionDef {
        &DEFINITIONS[self.0 as usize]
    }

    pub fn id(self) -> &'static str {
        self.def().id
    }

    pub fn title(self) -> &'static str {
        self.def().title
    }

    pub fn group(self) -> &'static str {
        self.def().group
    }

    pub fn level(self) -> Level {
        self.def().level
    }

    /// Look a permission up by its identifier.
    pub fn parse(id: &str) -> Option<Self> {
        PermissionCatalog::global().lookup(id)
    }

    /// Lookup of an identifier the catalog is known to contain.
    pub fn builtin(id: &'static str) -> Self {
        Self::parse(id).unwrap_or_else(|| unreachable!("{} is in the catalog", id))
    }

    /// Panicking lookup for identifiers known at compile time.
    #[cfg(test)]
    pub(crate) fn known(id: &str) -> Self {
        Self::parse(id).unwrap_or_else(|| panic!("unknown permission '{}'", id))
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permission({})", self.id())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = String::deserialize(deserializer)?;
        Permission::parse(&id)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown permission '{}'", id)))
    }
}

pub type PermissionSet = BTreeSet<Permission>;

/// Catalog with the precomputed implication closure.
pub struct PermissionCatalog {
    by_id: HashMap<&'static str, Permission>,
    /// `closure[i]` holds permission `i` and everything reachable from it.
    closure: Vec<PermissionSet>,
}

static CATALOG: Lazy<PermissionCatalog> = Lazy::new(PermissionCatalog::build);

impl PermissionCatalog {
    pub fn global() -> &'static PermissionCatalog {
        &CATALOG
    }

    fn build() -> Self {
        let by_id: HashMap<&'static str, Permission> = DEFINITIONS
            .iter()
            .enumerate()
            .map(|(index, def)| (def.id, Permission(index as u16)))
            .collect();

        let edges: Vec<Vec<Permission>> = DEFINITIONS
            .iter()
            .map(|def| {
                def.implies
                    .iter()
                    .filter_map(|implied| by_id.get(implied).copied())
                    .collect()
            })
            .collect();

        let closure = (0..DEFINITIONS.len())
            .map(|start| {
                let mut reached = PermissionSet::new();
                let mut stack = vec![Permission(start as u16)];
                while let Some(next) = stack.pop() {
                    if reached.insert(next) {
                        stack.extend(edges[next.0 as usize].iter().copied());
                    }
                }
                reached
            })
            .collect();

        Self { by_id, closure }
    }

    pub fn lookup(&self, id: &str) -> Option<Permission> {
        self.by_id.get(id).copied()
    }

    pub fn is_valid(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn level(&self, permission: Permission) -> Level {
        permission.level()
    }

    /// All catalog permissions, in catalog order.
    pub fn all(&self) -> PermissionSet {
        (0..DEFINITIONS.len())
            .map(|index| Permission(index as u16))
            .collect()
    }

    /// Closure of `permissions` under the implication graph.
    pub fn expand<'a, I>(&self, permissions: I) -> PermissionSet
    where
        I: IntoIterator<Item = &'a Permission>,
    {
        permissions
            .into_iter()
            .flat_map(|permission| self.closure[permission.0 as usize].iter().copied())
            .collect()
    }

    /// Parse identifiers, preserving first-seen order and dropping duplicates.
    /// Returns the unknown identifiers on failure.
    pub fn parse_all<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Permission>, Vec<String>> {
        let mut parsed: Vec<Permission> = Vec::with_capacity(ids.len());
        let mut unknown = Vec::new();
        for id in ids {
            match self.lookup(id.as_ref()) {
                Some(permission) if !parsed.contains(&permission) => parsed.push(permission),
                Some(_) => {}
                None => unknown.push(id.as_ref().to_string()),
            }
        }
        if unknown.is_empty() {
            Ok(parsed)
        } else {
            Err(unknown)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
