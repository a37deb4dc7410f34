//! Resource selector: hierarchical resource scopes.
//!
//! Hierarchy: Organization ⊇ Project(s) ⊇ Target(s) ⊇ Service(s), App deployment(s)
//!
//! A scope is either every resource of the organization, or an explicit list of
//! projects where each project carries its own target scope, and each listed
//! target its own service and app deployment scopes. Absence of a project
//! means no access to it; an empty granular list grants nothing. Services and
//! app deployments are addressed by name and default to all of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::Level;

/// Resources a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ResourceScope {
    /// Every project and target in the organization, including future ones.
    All,
    Granular { projects: Vec<ProjectScope> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectScope {
    pub project_id: Uuid,
    pub targets: TargetScope,
}

/// Targets of a single project a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TargetScope {
    All,
    Granular { targets: Vec<TargetSelection> },
}

/// One listed target and the named resources below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelection {
    pub target_id: Uuid,
    #[serde(default)]
    pub services: NameScope,
    #[serde(default)]
    pub app_deployments: NameScope,
}

/// Services or app deployments of one target, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NameScope {
    #[default]
    All,
    Granular { names: Vec<String> },
}

impl ResourceScope {
    pub fn none() -> Self {
        ResourceScope::Granular { projects: vec![] }
    }

    /// A scope covering one project and all of its targets.
    pub fn project(project_id: Uuid) -> Self {
        ResourceScope::Granular {
            projects: vec![ProjectScope {
                project_id,
                targets: TargetScope::All,
            }],
        }
    }

    /// True if the scope grants access to no project at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, ResourceScope::Granular { projects } if projects.is_empty())
    }

    /// Canonical form: projects sorted by id, duplicates merged, target and
    /// name lists sorted and deduplicated.
    pub fn normalized(&self) -> Self {
        match self {
            ResourceScope::All => ResourceScope::All,
            ResourceScope::Granular { projects } => ResourceScope::Granular {
                projects: group_projects(projects)
                    .into_iter()
                    .map(|(project_id, targets)| ProjectScope { project_id, targets })
                    .collect(),
            },
        }
    }

    /// Largest scope both sides agree on. A project missing from either side is
    /// dropped. The result is normalized, so the operation is commutative.
    pub fn intersect(&self, other: &ResourceScope) -> ResourceScope {
        match (self, other) {
            (ResourceScope::All, ResourceScope::All) => ResourceScope::All,
            (ResourceScope::All, granular) | (granular, ResourceScope::All) => {
                granular.normalized()
            }
            (ResourceScope::Granular { projects: a }, ResourceScope::Granular { projects: b }) => {
                let b = group_projects(b);
                ResourceScope::Granular {
                    projects: group_projects(a)
                        .into_iter()
                        .filter_map(|(project_id, targets_a)| {
                            b.get(&project_id).map(|targets_b| ProjectScope {
                                project_id,
                                targets: targets_a.intersect(targets_b),
                            })
                        })
                        .collect(),
                }
            }
        }
    }

    /// Smallest scope containing both sides.
    pub fn union(&self, other: &ResourceScope) -> ResourceScope {
        match (self, other) {
            (ResourceScope::All, _) | (_, ResourceScope::All) => ResourceScope::All,
            (ResourceScope::Granular { projects: a }, ResourceScope::Granular { projects: b }) => {
                ResourceScope::Granular {
                    projects: a.iter().chain(b.iter()).cloned().collect(),
                }
                .normalized()
            }
        }
    }

    pub fn is_subset_of(&self, other: &ResourceScope) -> bool {
        self.intersect(other) == self.normalized()
    }

    /// Every service or app deployment name the scope lists.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let projects = match self {
            ResourceScope::All => &[][..],
            ResourceScope::Granular { projects } => &projects[..],
        };
        projects
            .iter()
            .flat_map(|project| match &project.targets {
                TargetScope::All => &[][..],
                TargetScope::Granular { targets } => &targets[..],
            })
            .flat_map(|target| target.services.names().chain(target.app_deployments.names()))
    }

    /// Resource id patterns this scope covers at `level`, in the
    /// `org[/project[/target[/service|appDeployment/name]]]` form with a
    /// trailing `*` for "anything below".
    pub fn resource_patterns(&self, organization_id: Uuid, level: Level) -> Vec<String> {
        if level == Level::Organization {
            return vec![organization_id.to_string()];
        }
        let projects = match self {
            ResourceScope::All => return vec![format!("{}/*", organization_id)],
            ResourceScope::Granular { projects } => projects,
        };

        projects
            .iter()
            .flat_map(|project| {
                let base = format!("{}/{}", organization_id, project.project_id);
                match (level, &project.targets) {
                    (Level::Project, _) => vec![base],
                    (_, TargetScope::All) => vec![format!("{}/*", base)],
                    (_, TargetScope::Granular { targets }) => targets
                        .iter()
                        .flat_map(|target| target.patterns(&base, level))
                        .collect(),
                }
            })
            .collect()
    }
}

fn group_projects(projects: &[ProjectScope]) -> BTreeMap<Uuid, TargetScope> {
    let mut merged: BTreeMap<Uuid, TargetScope> = BTreeMap::new();
    for project in projects {
        let targets = match merged.remove(&project.project_id) {
            Some(existing) => existing.union(&project.targets),
            None => project.targets.normalized(),
        };
        merged.insert(project.project_id, targets);
    }
    merged
}

impl TargetScope {
    pub fn none() -> Self {
        TargetScope::Granular { targets: vec![] }
    }

    /// Listed targets with every service and app deployment below them.
    pub fn ids(target_ids: &[Uuid]) -> Self {
        TargetScope::Granular {
            targets: target_ids.iter().copied().map(TargetSelection::all).collect(),
        }
    }

    pub fn normalized(&self) -> Self {
        match self {
            TargetScope::All => TargetScope::All,
            TargetScope::Granular { targets } => TargetScope::from_grouped(group_targets(targets)),
        }
    }

    pub fn intersect(&self, other: &TargetScope) -> TargetScope {
        match (self, other) {
            (TargetScope::All, TargetScope::All) => TargetScope::All,
            (TargetScope::All, granular) | (granular, TargetScope::All) => granular.normalized(),
            (TargetScope::Granular { targets: a }, TargetScope::Granular { targets: b }) => {
                let b = group_targets(b);
                TargetScope::from_grouped(
                    group_targets(a)
                        .into_iter()
                        .filter_map(|(target_id, (services, deployments))| {
                            b.get(&target_id).map(|(other_services, other_deployments)| {
                                (
                                    target_id,
                                    (
                                        services.intersect(other_services),
                                        deployments.intersect(other_deployments),
                                    ),
                                )
                            })
                        })
                        .collect(),
                )
            }
        }
    }

    pub fn union(&self, other: &TargetScope) -> TargetScope {
        match (self, other) {
            (TargetScope::All, _) | (_, TargetScope::All) => TargetScope::All,
            (TargetScope::Granular { targets: a }, TargetScope::Granular { targets: b }) => {
                TargetScope::Granular {
                    targets: a.iter().chain(b.iter()).cloned().collect(),
                }
                .normalized()
            }
        }
    }

    fn from_grouped(grouped: BTreeMap<Uuid, (NameScope, NameScope)>) -> Self {
        TargetScope::Granular {
            targets: grouped
                .into_iter()
                .map(|(target_id, (services, app_deployments))| TargetSelection {
                    target_id,
                    services,
                    app_deployments,
                })
                .collect(),
        }
    }
}

/// Targets by id, duplicate entries merged by union of their name scopes.
fn group_targets(targets: &[TargetSelection]) -> BTreeMap<Uuid, (NameScope, NameScope)> {
    let mut merged: BTreeMap<Uuid, (NameScope, NameScope)> = BTreeMap::new();
    for target in targets {
        let scopes = match merged.remove(&target.target_id) {
            Some((services, deployments)) => (
                services.union(&target.services),
                deployments.union(&target.app_deployments),
            ),
            None => (
                target.services.normalized(),
                target.app_deployments.normalized(),
            ),
        };
        merged.insert(target.target_id, scopes);
    }
    merged
}

impl TargetSelection {
    pub fn all(target_id: Uuid) -> Self {
        Self {
            target_id,
            services: NameScope::All,
            app_deployments: NameScope::All,
        }
    }

    fn patterns(&self, project_base: &str, level: Level) -> Vec<String> {
        let base = format!("{}/{}", project_base, self.target_id);
        match level {
            Level::Organization | Level::Project | Level::Target => vec![base],
            Level::Service => self.services.patterns(&base, "service"),
            Level::AppDeployment => self.app_deployments.patterns(&base, "appDeployment"),
        }
    }
}

impl NameScope {
    pub fn normalized(&self) -> Self {
        match self {
            NameScope::All => NameScope::All,
            NameScope::Granular { names } => {
                let mut names = names.clone();
                names.sort();
                names.dedup();
                NameScope::Granular { names }
            }
        }
    }

    pub fn intersect(&self, other: &NameScope) -> NameScope {
        match (self, other) {
            (NameScope::All, NameScope::All) => NameScope::All,
            (NameScope::All, granular) | (granular, NameScope::All) => granular.normalized(),
            (NameScope::Granular { names: a }, NameScope::Granular { names: b }) => {
                NameScope::Granular {
                    names: a.iter().filter(|n| b.contains(n)).cloned().collect(),
                }
                .normalized()
            }
        }
    }

    pub fn union(&self, other: &NameScope) -> NameScope {
        match (self, other) {
            (NameScope::All, _) | (_, NameScope::All) => NameScope::All,
            (NameScope::Granular { names: a }, NameScope::Granular { names: b }) => {
                NameScope::Granular {
                    names: a.iter().chain(b.iter()).cloned().collect(),
                }
                .normalized()
            }
        }
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        let names = match self {
            NameScope::All => &[][..],
            NameScope::Granular { names } => &names[..],
        };
        names.iter().map(String::as_str)
    }

    fn patterns(&self, target_base: &str, kind: &str) -> Vec<String> {
        match self {
            NameScope::All => vec![format!("{}/{}/*", target_base, kind)],
            NameScope::Granular { names } => names
                .iter()
                .map(|name| format!("{}/{}/{}", target_base, kind, name))
                .collect(),
        }
    }
}

/// Service and app deployment names become path segments, so they may not
/// contain the separator or the wildcard.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 100 && !name.contains(['/', '*'])
}

/// A named resource below a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChild {
    Service(String),
    AppDeployment(String),
}

/// Identifies one concrete resource a permission is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub organization_id: Uuid,
    pub project_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub child: Option<TargetChild>,
}

impl ResourcePath {
    pub fn organization(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            project_id: None,
            target_id: None,
            child: None,
        }
    }

    pub fn project(organization_id: Uuid, project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::organization(organization_id)
        }
    }

    pub fn target(organization_id: Uuid, project_id: Uuid, target_id: Uuid) -> Self {
        Self {
            target_id: Some(target_id),
            ..Self::project(organization_id, project_id)
        }
    }

    pub fn service(organization_id: Uuid, project_id: Uuid, target_id: Uuid, name: &str) -> Self {
        Self {
            child: Some(TargetChild::Service(name.to_string())),
            ..Self::target(organization_id, project_id, target_id)
        }
    }

    pub fn app_deployment(
        organization_id: Uuid,
        project_id: Uuid,
        target_id: Uuid,
        name: &str,
    ) -> Self {
        Self {
            child: Some(TargetChild::AppDeployment(name.to_string())),
            ..Self::target(organization_id, project_id, target_id)
        }
    }

    /// The path truncated to `level`, or `None` if the path does not reach that
    /// deep (a target permission cannot be checked against a project).
    pub fn at_level(&self, level: Level) -> Option<String> {
        let org = self.organization_id;
        match (level, self.project_id, self.target_id, &self.child) {
            (Level::Organization, ..) => Some(org.to_string()),
            (Level::Project, Some(project), ..) => Some(format!("{}/{}", org, project)),
            (Level::Target, Some(project), Some(target), _) => {
                Some(format!("{}/{}/{}", org, project, target))
            }
            (Level::Service, Some(project), Some(target), Some(TargetChild::Service(name))) => {
                Some(format!("{}/{}/{}/service/{}", org, project, target, name))
            }
            (
                Level::AppDeployment,
                Some(project),
                Some(target),
                Some(TargetChild::AppDeployment(name)),
            ) => Some(format!("{}/{}/{}/appDeployment/{}", org, project, target, name)),
            _ => None,
        }
    }
}

/// Match a resource id against a pattern: exact, or a trailing `/*` meaning any
/// resource below that parent.
pub fn pattern_matches(pattern: &str, resource_id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => {
            resource_id.starts_with(prefix) && resource_id.len() > prefix.len()
        }
        _ => pattern == resource_id,
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid, Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    fn granular(projects: Vec<(Uuid, TargetScope)>) -> ResourceScope {
        ResourceScope::Granular {
            projects: projects
                .into_iter()
                .map(|(project_id, targets)| ProjectScope { project_id, targets })
                .collect(),
        }
    }

    fn services(target_id: Uuid, names: &[&str]) -> TargetSelection {
        TargetSelection {
            services: NameScope::Granular {
                names: names.iter().map(|n| n.to_string()).collect(),
            },
            ..TargetSelection::all(target_id)
        }
    }

    fn matches_any(patterns: &[String], resource_id: &str) -> bool {
        patterns.iter().any(|p| pattern_matches(p, resource_id))
    }

    #[test]
    fn test_empty_granular_covers_nothing() {
        let (org, _, _, _) = ids();
        let scope = ResourceScope::none();
        assert!(scope.is_empty());
        for level in [Level::Project, Level::Target, Level::Service] {
            assert!(scope.resource_patterns(org, level).is_empty());
        }
    }

    #[test]
    fn test_intersect_drops_projects_missing_on_one_side() {
        let (p1, p2, _, _) = ids();
        let a = granular(vec![(p1, TargetScope::All), (p2, TargetScope::All)]);
        let b = granular(vec![(p1, TargetScope::All)]);
        assert_eq!(a.intersect(&b), granular(vec![(p1, TargetScope::All)]));
    }

    #[test]
    fn test_intersect_all_targets_with_granular_targets() {
        let (p1, _, t1, t2) = ids();
        let a = granular(vec![(p1, TargetScope::All)]);
        let b = granular(vec![(p1, TargetScope::ids(&[t2, t1]))]);
        assert_eq!(
            a.intersect(&b),
            granular(vec![(p1, TargetScope::ids(&[t1, t2]).normalized())])
        );
    }

    #[test]
    fn test_intersect_with_empty_is_empty() {
        let (p1, _, _, _) = ids();
        let a = granular(vec![(p1, TargetScope::All)]);
        assert!(a.intersect(&ResourceScope::none()).is_empty());
        assert!(ResourceScope::All.intersect(&ResourceScope::none()).is_empty());
    }

    #[test]
    fn test_intersect_is_commutative_and_idempotent() {
        let (p1, p2, t1, t2) = ids();
        let a = granular(vec![(p2, TargetScope::ids(&[t1, t2])), (p1, TargetScope::All)]);
        let b = granular(vec![
            (p1, TargetScope::ids(&[t2])),
            (
                p2,
                TargetScope::Granular {
                    targets: vec![services(t1, &["users", "orders"])],
                },
            ),
        ]);
        let ab = a.intersect(&b);
        assert_eq!(ab, b.intersect(&a));
        assert_eq!(ab.intersect(&b), ab);
        assert_eq!(ab.intersect(&ab), ab);
    }

    #[test]
    fn test_intersect_narrows_service_names() {
        let (p1, _, t1, _) = ids();
        let a = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["users", "orders"])],
            },
        )]);
        let b = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["orders", "billing"])],
            },
        )]);
        assert_eq!(
            a.intersect(&b),
            granular(vec![(
                p1,
                TargetScope::Granular {
                    targets: vec![services(t1, &["orders"])],
                },
            )])
        );
    }

    #[test]
    fn test_duplicate_targets_merge_by_union() {
        let (p1, _, t1, _) = ids();
        let scope = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["users"]), services(t1, &["orders", "users"])],
            },
        )]);
        assert_eq!(
            scope.normalized(),
            granular(vec![(
                p1,
                TargetScope::Granular {
                    targets: vec![services(t1, &["orders", "users"])],
                },
            )])
        );
    }

    #[test]
    fn test_union_and_subset() {
        let (p1, p2, t1, _) = ids();
        let a = granular(vec![(p1, TargetScope::ids(&[t1]))]);
        let b = granular(vec![(p2, TargetScope::All)]);
        let both = a.union(&b);
        assert!(a.is_subset_of(&both));
        assert!(b.is_subset_of(&both));
        assert!(!both.is_subset_of(&a));
        assert!(both.is_subset_of(&ResourceScope::All));
        assert!(!ResourceScope::All.is_subset_of(&both));
        assert!(ResourceScope::none().is_subset_of(&a));

        let one_service = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["users"])],
            },
        )]);
        assert!(one_service.is_subset_of(&a));
        assert!(!a.is_subset_of(&one_service));
    }

    #[test]
    fn test_resource_patterns() {
        let (org, p1, t1, _) = ids();
        assert_eq!(
            ResourceScope::All.resource_patterns(org, Level::Organization),
            vec![org.to_string()]
        );
        assert_eq!(
            ResourceScope::All.resource_patterns(org, Level::Project),
            vec![format!("{}/*", org)]
        );
        let scope = granular(vec![(p1, TargetScope::ids(&[t1]))]);
        assert_eq!(
            scope.resource_patterns(org, Level::Project),
            vec![format!("{}/{}", org, p1)]
        );
        assert_eq!(
            scope.resource_patterns(org, Level::Target),
            vec![format!("{}/{}/{}", org, p1, t1)]
        );
        assert_eq!(
            scope.resource_patterns(org, Level::Service),
            vec![format!("{}/{}/{}/service/*", org, p1, t1)]
        );
        assert_eq!(
            scope.resource_patterns(org, Level::AppDeployment),
            vec![format!("{}/{}/{}/appDeployment/*", org, p1, t1)]
        );
    }

    #[test]
    fn test_service_patterns_are_scoped_by_name() {
        let (org, p1, t1, _) = ids();
        let scope = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["users"])],
            },
        )]);
        let patterns = scope.resource_patterns(org, Level::Service);
        let users = ResourcePath::service(org, p1, t1, "users");
        let orders = ResourcePath::service(org, p1, t1, "orders");
        assert!(matches_any(&patterns, &users.at_level(Level::Service).unwrap()));
        assert!(!matches_any(&patterns, &orders.at_level(Level::Service).unwrap()));

        // App deployments of the same target stay fully covered.
        let app = ResourcePath::app_deployment(org, p1, t1, "web-app");
        let patterns = scope.resource_patterns(org, Level::AppDeployment);
        assert!(matches_any(&patterns, &app.at_level(Level::AppDeployment).unwrap()));
    }

    #[test]
    fn test_names_lists_granular_names() {
        let (p1, _, t1, _) = ids();
        let scope = granular(vec![(
            p1,
            TargetScope::Granular {
                targets: vec![services(t1, &["users", "bad/name"])],
            },
        )]);
        let names: Vec<&str> = scope.names().collect();
        assert_eq!(names, vec!["users", "bad/name"]);
        assert!(is_valid_name("users"));
        assert!(!is_valid_name("bad/name"));
        assert!(!is_valid_name("*"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("org", "org"));
        assert!(!pattern_matches("org", "org/p"));
        assert!(pattern_matches("org/*", "org/p"));
        assert!(pattern_matches("org/*", "org/p/t"));
        assert!(!pattern_matches("org/*", "org"));
        assert!(!pattern_matches("org/*", "other/p"));
        assert!(pattern_matches("org/p/*", "org/p/t"));
        assert!(!pattern_matches("org/p/*", "org/p"));
        assert!(pattern_matches("org/p/t/service/*", "org/p/t/service/users"));
        assert!(!pattern_matches("org/p/t/service/*", "org/p/t/appDeployment/users"));
    }

    #[test]
    fn test_path_at_level() {
        let (org, p1, t1, _) = ids();
        let project = ResourcePath::project(org, p1);
        assert_eq!(project.at_level(Level::Organization), Some(org.to_string()));
        assert_eq!(project.at_level(Level::Project), Some(format!("{}/{}", org, p1)));
        assert_eq!(project.at_level(Level::Target), None);
        let target = ResourcePath::target(org, p1, t1);
        assert_eq!(target.at_level(Level::Project), Some(format!("{}/{}", org, p1)));
        assert_eq!(target.at_level(Level::Service), None);

        let service = ResourcePath::service(org, p1, t1, "users");
        assert_eq!(
            service.at_level(Level::Target),
            Some(format!("{}/{}/{}", org, p1, t1))
        );
        assert_eq!(
            service.at_level(Level::Service),
            Some(format!("{}/{}/{}/service/users", org, p1, t1))
        );
        assert_eq!(service.at_level(Level::AppDeployment), None);
    }

    #[test]
    fn test_scope_serde_shape() {
        let (p1, _, t1, _) = ids();
        let json = serde_json::to_value(granular(vec![(p1, TargetScope::All)])).unwrap();
        assert_eq!(json["mode"], "granular");
        assert_eq!(json["projects"][0]["projectId"], p1.to_string());
        assert_eq!(json["projects"][0]["targets"]["mode"], "all");
        let all: ResourceScope = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all, ResourceScope::All);

        // Service and app deployment scopes default to all.
        let targets: TargetScope = serde_json::from_value(serde_json::json!({
            "mode": "granular",
            "targets": [{ "targetId": t1 }],
        }))
        .unwrap();
        assert_eq!(targets, TargetScope::ids(&[t1]));
    }
}
