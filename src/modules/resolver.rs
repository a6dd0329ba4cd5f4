// src/modules/resolver.rs
//! Vendor module resolution
//!
//! The vendor automation toolkit ships as a family of interdependent,
//! independently-versioned modules, and machines routinely carry several
//! versions of each side by side. The resolver chooses one version-consistent
//! set per interpreter lifetime:
//!
//! 1. Group installed versions by module name, newest first
//! 2. Take the latest candidate per required module (honoring a pinned
//!    version when configured)
//! 3. Reconcile the anchor/dependent pair at the `major.minor` level:
//!    downgrade the dependent to the anchor's branch, or drop it entirely
//! 4. Emit load order Foundation → Core → Extension with three escalating
//!    load strategies per module
//!
//! Missing optional modules only reduce capability; a plan is viable as long
//! as at least one mandatory module is installed.

use crate::execution::process_runner::ProcessRunner;
use crate::execution::types::ExecutionRequest;
use crate::modules::version::ModuleVersion;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// The module every other vendor module layers on; its selected version
/// anchors the branch the whole plan must agree on.
pub const ANCHOR_MODULE: &str = "VMware.VimAutomation.Common";

/// The module carrying the core remote-management command vocabulary; must
/// match the anchor at the `major.minor` level.
pub const DEPENDENT_MODULE: &str = "VMware.VimAutomation.Core";

/// Load phase of a required module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleRole {
    Foundation,
    Core,
    Extension,
}

/// One module the engine wants loaded
#[derive(Debug, Clone, Copy)]
pub struct RequiredModule {
    pub name: &'static str,
    pub role: ModuleRole,
    pub mandatory: bool,
}

/// Required modules in load order
pub const REQUIRED_MODULES: &[RequiredModule] = &[
    RequiredModule {
        name: "VMware.VimAutomation.Sdk",
        role: ModuleRole::Foundation,
        mandatory: false,
    },
    RequiredModule {
        name: ANCHOR_MODULE,
        role: ModuleRole::Foundation,
        mandatory: true,
    },
    RequiredModule {
        name: "VMware.VimAutomation.Cis.Core",
        role: ModuleRole::Core,
        mandatory: false,
    },
    RequiredModule {
        name: DEPENDENT_MODULE,
        role: ModuleRole::Core,
        mandatory: true,
    },
    RequiredModule {
        name: "VMware.VimAutomation.Storage",
        role: ModuleRole::Extension,
        mandatory: false,
    },
    RequiredModule {
        name: "VMware.VimAutomation.Vds",
        role: ModuleRole::Extension,
        mandatory: false,
    },
];

/// Version pairs known to break each other regardless of branch math.
/// Entries are ((module, major, minor), (module, major, minor)).
const KNOWN_INCOMPATIBLE: &[((&str, u64, u64), (&str, u64, u64))] = &[
    ((ANCHOR_MODULE, 13, 0), ("VMware.VimAutomation.Cis.Core", 12, 7)),
    ((ANCHOR_MODULE, 12, 7), ("VMware.VimAutomation.Storage", 13, 0)),
];

/// One module found on the machine
#[derive(Debug, Clone)]
pub struct InstalledModule {
    pub name: String,
    pub version: ModuleVersion,
    pub path: PathBuf,
}

/// One module chosen for loading
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: ModuleVersion,
    pub path: PathBuf,
    pub mandatory: bool,
    pub loaded: bool,
}

/// A module left out of the plan, with the reason
#[derive(Debug, Clone)]
pub struct SkippedModule {
    pub name: String,
    pub reason: String,
}

/// The resolved, version-consistent module set for one interpreter lifetime
#[derive(Debug, Clone, Default)]
pub struct ModuleLoadPlan {
    /// Chosen modules in load order; never two versions of one name
    pub modules: Vec<ModuleDescriptor>,

    /// Modules dropped or absent, with reasons
    pub skipped: Vec<SkippedModule>,

    /// Human-readable notes for every decision and failed attempt
    pub diagnostics: Vec<String>,
}

impl ModuleLoadPlan {
    /// Look up a chosen module by name
    pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Whether the plan selects any modules at all
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Mark descriptors as loaded, except those named in `failures`
    /// (as parsed from a load-script run)
    pub fn apply_load_results(&mut self, failures: &[String]) {
        for module in &mut self.modules {
            module.loaded = !failures.contains(&module.name);
        }
    }

    /// Whether at least one mandatory module ended up loaded
    pub fn has_mandatory_loaded(&self) -> bool {
        self.modules.iter().any(|m| m.mandatory && m.loaded)
    }
}

/// Where the resolver learns what is installed
enum InventorySource {
    /// A fixed inventory, supplied directly
    Static(Vec<InstalledModule>),

    /// Probe the machine through an isolated interpreter process
    Probe(Arc<ProcessRunner>),
}

/// Chooses a version-consistent module set, memoized per resolver lifetime
pub struct ModuleResolver {
    source: InventorySource,
    pinned: Option<ModuleVersion>,
    plan: OnceCell<ModuleLoadPlan>,
}

impl ModuleResolver {
    /// Resolver over a fixed inventory
    pub fn with_inventory(inventory: Vec<InstalledModule>) -> Self {
        Self {
            source: InventorySource::Static(inventory),
            pinned: None,
            plan: OnceCell::new(),
        }
    }

    /// Resolver that probes the machine through `runner`
    pub fn discovering(runner: Arc<ProcessRunner>) -> Self {
        Self {
            source: InventorySource::Probe(runner),
            pinned: None,
            plan: OnceCell::new(),
        }
    }

    /// Pin the vendor toolkit to one version instead of the newest
    pub fn with_pinned(mut self, pinned: Option<ModuleVersion>) -> Self {
        self.pinned = pinned;
        self
    }

    /// The memoized load plan, computing it on first use
    pub async fn plan(&self) -> Result<&ModuleLoadPlan> {
        self.plan
            .get_or_try_init(|| async {
                let inventory = match &self.source {
                    InventorySource::Static(inventory) => inventory.clone(),
                    InventorySource::Probe(runner) => discover_inventory(runner).await?,
                };
                resolve(&inventory, self.pinned.as_ref())
            })
            .await
    }
}

/// Script that lists installed vendor modules as JSON
pub fn inventory_script() -> &'static str {
    "Get-Module -ListAvailable -Name 'VMware.*' | \
     Select-Object Name, @{N='Version';E={$_.Version.ToString()}}, ModuleBase | \
     ConvertTo-Json -Depth 3"
}

/// Probe the machine for installed vendor modules
pub async fn discover_inventory(runner: &ProcessRunner) -> Result<Vec<InstalledModule>> {
    let request = ExecutionRequest::new(inventory_script())
        .with_timeout(Duration::from_secs(60))
        .with_captured_objects();

    let result = runner.run(&request).await?;
    if !result.success {
        return Err(EngineError::ModuleResolution(format!(
            "module inventory probe failed: {}",
            result.error.trim()
        )));
    }

    let inventory = parse_inventory(&result.objects);
    info!("Discovered {} installed vendor modules", inventory.len());
    Ok(inventory)
}

/// Parse inventory objects emitted by [`inventory_script`].
///
/// Versions arrive either as strings or as expanded `{Major, Minor, ...}`
/// objects depending on interpreter serialization depth; unparseable entries
/// are skipped with a warning rather than failing the probe.
pub fn parse_inventory(objects: &[Value]) -> Vec<InstalledModule> {
    let mut inventory = Vec::new();

    for object in objects {
        let Some(name) = object.get("Name").and_then(Value::as_str) else {
            continue;
        };
        let Some(version) = parse_version_value(object.get("Version")) else {
            warn!("Skipping module '{}' with unparseable version", name);
            continue;
        };
        let path = object
            .get("ModuleBase")
            .and_then(Value::as_str)
            .unwrap_or_default();

        inventory.push(InstalledModule {
            name: name.to_string(),
            version,
            path: PathBuf::from(path),
        });
    }

    inventory
}

fn parse_version_value(value: Option<&Value>) -> Option<ModuleVersion> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Object(fields) => {
            let component = |key: &str| {
                fields
                    .get(key)
                    .and_then(Value::as_i64)
                    .filter(|v| *v >= 0)
                    .map(|v| v as u64)
            };
            let major = component("Major")?;
            let minor = component("Minor").unwrap_or(0);
            let build = component("Build").unwrap_or(0);
            let revision = component("Revision").unwrap_or(0);
            Some(ModuleVersion::new(&[major, minor, build, revision]))
        }
        _ => None,
    }
}

/// Resolve a load plan from an inventory.
///
/// Fails only when no mandatory module is installed at all; everything else
/// degrades gracefully into `skipped` entries and diagnostics.
pub fn resolve(
    inventory: &[InstalledModule],
    pinned: Option<&ModuleVersion>,
) -> Result<ModuleLoadPlan> {
    let mut plan = ModuleLoadPlan::default();

    // Group installed versions by name, newest first
    let mut grouped: HashMap<&str, Vec<&InstalledModule>> = HashMap::new();
    for module in inventory {
        grouped.entry(module.name.as_str()).or_default().push(module);
    }
    for versions in grouped.values_mut() {
        versions.sort_by(|a, b| b.version.cmp(&a.version));
    }

    // Latest candidate per required module
    let mut selected: HashMap<&str, &InstalledModule> = HashMap::new();
    for required in REQUIRED_MODULES {
        let Some(candidates) = grouped.get(required.name) else {
            plan.skipped.push(SkippedModule {
                name: required.name.to_string(),
                reason: "not installed".to_string(),
            });
            continue;
        };

        let choice = match pinned {
            Some(pinned) => match candidates.iter().find(|c| &c.version == pinned).copied() {
                Some(exact) => exact,
                None => {
                    plan.diagnostics.push(format!(
                        "{}: pinned version {} not installed, using {}",
                        required.name, pinned, candidates[0].version
                    ));
                    candidates[0]
                }
            },
            None => candidates[0],
        };

        selected.insert(required.name, choice);
    }

    if !REQUIRED_MODULES
        .iter()
        .any(|r| r.mandatory && selected.contains_key(r.name))
    {
        return Err(EngineError::ModuleResolution(
            "no mandatory vendor module is installed".to_string(),
        ));
    }

    // Anchor/dependent branch reconciliation: compatibility outranks recency
    let branch_mismatch = match (selected.get(ANCHOR_MODULE), selected.get(DEPENDENT_MODULE)) {
        (Some(anchor), Some(dependent)) if !anchor.version.same_branch(&dependent.version) => {
            Some((anchor.version.clone(), dependent.version.clone()))
        }
        _ => None,
    };

    if let Some((anchor_version, latest_dependent)) = branch_mismatch {
        let fallback = grouped
            .get(DEPENDENT_MODULE)
            .and_then(|candidates| {
                candidates
                    .iter()
                    .find(|c| c.version.same_branch(&anchor_version))
            })
            .copied();

        match fallback {
            Some(compatible) => {
                plan.diagnostics.push(format!(
                    "{}: latest {} mismatches anchor branch {}.{}, selected {} instead",
                    DEPENDENT_MODULE,
                    latest_dependent,
                    anchor_version.major(),
                    anchor_version.minor(),
                    compatible.version
                ));
                selected.insert(DEPENDENT_MODULE, compatible);
            }
            None => {
                plan.diagnostics.push(format!(
                    "{}: no installed version matches anchor branch {}.{}, dropping it",
                    DEPENDENT_MODULE,
                    anchor_version.major(),
                    anchor_version.minor()
                ));
                plan.skipped.push(SkippedModule {
                    name: DEPENDENT_MODULE.to_string(),
                    reason: format!(
                        "no version compatible with {} {}",
                        ANCHOR_MODULE, anchor_version
                    ),
                });
                selected.remove(DEPENDENT_MODULE);
            }
        }
    }

    // Known-incompatible pairs: demote the second member of the pair
    for ((name_a, major_a, minor_a), (name_b, major_b, minor_b)) in KNOWN_INCOMPATIBLE {
        let hit = matches!(
            (selected.get(name_a), selected.get(name_b)),
            (Some(a), Some(b))
                if a.version.major() == *major_a && a.version.minor() == *minor_a
                    && b.version.major() == *major_b && b.version.minor() == *minor_b
        );

        if hit {
            let replacement = grouped
                .get(*name_b)
                .and_then(|candidates| {
                    candidates
                        .iter()
                        .find(|c| !(c.version.major() == *major_b && c.version.minor() == *minor_b))
                })
                .copied();

            match replacement {
                Some(other) => {
                    plan.diagnostics.push(format!(
                        "{}: {}.{} is known-incompatible with {} {}.{}, selected {} instead",
                        name_b, major_b, minor_b, name_a, major_a, minor_a, other.version
                    ));
                    selected.insert(*name_b, other);
                }
                None => {
                    plan.diagnostics.push(format!(
                        "{}: only installed version {}.{} is known-incompatible with {} {}.{}, dropping it",
                        name_b, major_b, minor_b, name_a, major_a, minor_a
                    ));
                    plan.skipped.push(SkippedModule {
                        name: name_b.to_string(),
                        reason: format!("known-incompatible with {}", name_a),
                    });
                    selected.remove(*name_b);
                }
            }
        }
    }

    // Emit in fixed Foundation → Core → Extension order; one entry per name
    for required in REQUIRED_MODULES {
        if let Some(module) = selected.get(required.name) {
            debug!(
                "Planned {} v{} from {:?}",
                module.name, module.version, module.path
            );
            plan.modules.push(ModuleDescriptor {
                name: module.name.clone(),
                version: module.version.clone(),
                path: module.path.clone(),
                mandatory: required.mandatory,
                loaded: false,
            });
        }
    }

    Ok(plan)
}

/// Marker the load script emits on stderr for each module that failed all
/// of its load strategies
const LOAD_FAILURE_MARKER: &str = "VIRTOPS_MODULE_FAILED";

/// Render the module-loading script for a plan.
///
/// Per module: import by name and exact version, then import by install
/// path, and (for mandatory modules only) load the component libraries
/// directly before one more import by name.
pub fn load_script(plan: &ModuleLoadPlan) -> Option<String> {
    if plan.is_empty() {
        return None;
    }

    let mut script = String::new();
    for module in &plan.modules {
        let path = module.path.display();
        script.push_str(&format!(
            "$__ok = $false\n\
             try {{\n\
             \x20   Import-Module -Name '{name}' -RequiredVersion '{version}' -ErrorAction Stop\n\
             \x20   $__ok = $true\n\
             }} catch {{\n\
             \x20   Write-Warning ('import of {name} v{version} by name failed: ' + $_.Exception.Message)\n\
             }}\n\
             if (-not $__ok) {{\n\
             \x20   try {{\n\
             \x20       Import-Module '{path}' -ErrorAction Stop\n\
             \x20       $__ok = $true\n\
             \x20   }} catch {{\n\
             \x20       Write-Warning ('import of {name} by path failed: ' + $_.Exception.Message)\n\
             \x20   }}\n\
             }}\n",
            name = module.name,
            version = module.version,
            path = path,
        ));

        if module.mandatory {
            script.push_str(&format!(
                "if (-not $__ok) {{\n\
                 \x20   Get-ChildItem -Path '{path}' -Filter '*.dll' -ErrorAction SilentlyContinue | ForEach-Object {{\n\
                 \x20       try {{ Add-Type -Path $_.FullName -ErrorAction Stop }} catch {{ }}\n\
                 \x20   }}\n\
                 \x20   try {{\n\
                 \x20       Import-Module -Name '{name}' -ErrorAction Stop\n\
                 \x20       $__ok = $true\n\
                 \x20   }} catch {{\n\
                 \x20       Write-Warning ('import of {name} after component load failed: ' + $_.Exception.Message)\n\
                 \x20   }}\n\
                 }}\n",
                name = module.name,
                path = path,
            ));
        }

        script.push_str(&format!(
            "if (-not $__ok) {{ [Console]::Error.WriteLine('{} {}') }}\n",
            LOAD_FAILURE_MARKER, module.name
        ));
    }

    Some(script)
}

/// Extract the names of modules whose load failed, from load-script stderr
pub fn parse_load_failures(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix(LOAD_FAILURE_MARKER)
                .map(|rest| rest.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn installed(name: &str, version: &str) -> InstalledModule {
        InstalledModule {
            name: name.to_string(),
            version: version.parse().unwrap(),
            path: PathBuf::from(format!("/opt/modules/{}/{}", name, version)),
        }
    }

    #[test]
    fn test_latest_version_selected_per_module() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed(ANCHOR_MODULE, "12.7.0"),
            installed(DEPENDENT_MODULE, "13.2.0"),
        ];

        let plan = resolve(&inventory, None).unwrap();
        let anchor = plan.descriptor(ANCHOR_MODULE).unwrap();
        assert_eq!(anchor.version.to_string(), "13.2.0");
    }

    #[test]
    fn test_compatibility_outranks_recency() {
        // The dependent module is installed at two versions; only the older
        // one matches the anchor's branch.
        let inventory = vec![
            installed(ANCHOR_MODULE, "12.7.0"),
            installed(DEPENDENT_MODULE, "13.0.0"),
            installed(DEPENDENT_MODULE, "12.7.0"),
        ];

        let plan = resolve(&inventory, None).unwrap();
        let dependent = plan.descriptor(DEPENDENT_MODULE).unwrap();
        assert_eq!(dependent.version.to_string(), "12.7.0");
        assert!(!plan.diagnostics.is_empty());
    }

    #[test]
    fn test_incompatible_dependent_dropped_not_fatal() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed(DEPENDENT_MODULE, "12.0.0"),
        ];

        let plan = resolve(&inventory, None).unwrap();
        assert!(plan.descriptor(ANCHOR_MODULE).is_some());
        assert!(plan.descriptor(DEPENDENT_MODULE).is_none());
        assert!(plan
            .skipped
            .iter()
            .any(|s| s.name == DEPENDENT_MODULE));
    }

    #[test]
    fn test_no_mandatory_module_fails_resolution() {
        let inventory = vec![installed("VMware.VimAutomation.Storage", "13.2.0")];
        let err = resolve(&inventory, None).unwrap_err();
        assert!(matches!(err, EngineError::ModuleResolution(_)));
    }

    #[test]
    fn test_plan_never_contains_duplicate_names() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed(ANCHOR_MODULE, "13.1.0"),
            installed(ANCHOR_MODULE, "12.7.0"),
            installed(DEPENDENT_MODULE, "13.2.0"),
        ];

        let plan = resolve(&inventory, None).unwrap();
        let mut names: Vec<_> = plan.modules.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), plan.modules.len());
    }

    #[test]
    fn test_pinned_version_selected_when_installed() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed(ANCHOR_MODULE, "12.7.0"),
            installed(DEPENDENT_MODULE, "12.7.0"),
        ];
        let pinned: ModuleVersion = "12.7.0".parse().unwrap();

        let plan = resolve(&inventory, Some(&pinned)).unwrap();
        assert_eq!(
            plan.descriptor(ANCHOR_MODULE).unwrap().version,
            pinned
        );
    }

    #[test]
    fn test_load_order_foundation_core_extension() {
        let inventory = vec![
            installed("VMware.VimAutomation.Vds", "13.2.0"),
            installed(DEPENDENT_MODULE, "13.2.0"),
            installed(ANCHOR_MODULE, "13.2.0"),
        ];

        let plan = resolve(&inventory, None).unwrap();
        let names: Vec<_> = plan.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![ANCHOR_MODULE, DEPENDENT_MODULE, "VMware.VimAutomation.Vds"]
        );
    }

    #[test]
    fn test_load_script_strategies() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed("VMware.VimAutomation.Storage", "13.2.0"),
        ];
        let plan = resolve(&inventory, None).unwrap();
        let script = load_script(&plan).unwrap();

        // By-version and by-path imports for everyone
        assert!(script.contains("-RequiredVersion '13.2.0'"));
        assert!(script.contains("Import-Module '/opt/modules/"));
        // Component-library fallback only for the mandatory module
        assert_eq!(script.matches("Add-Type -Path").count(), 1);
    }

    #[test]
    fn test_parse_load_failures() {
        let stderr = format!(
            "WARNING: import of X by name failed\n{} {}\nnoise\n",
            LOAD_FAILURE_MARKER, DEPENDENT_MODULE
        );
        assert_eq!(parse_load_failures(&stderr), vec![DEPENDENT_MODULE]);
    }

    #[test]
    fn test_apply_load_results_sets_flags() {
        let inventory = vec![
            installed(ANCHOR_MODULE, "13.2.0"),
            installed(DEPENDENT_MODULE, "13.2.0"),
        ];
        let mut plan = resolve(&inventory, None).unwrap();
        plan.apply_load_results(&[DEPENDENT_MODULE.to_string()]);

        assert!(plan.descriptor(ANCHOR_MODULE).unwrap().loaded);
        assert!(!plan.descriptor(DEPENDENT_MODULE).unwrap().loaded);
        assert!(plan.has_mandatory_loaded());
    }

    #[test]
    fn test_parse_inventory_version_shapes() {
        let objects = vec![
            json!({"Name": ANCHOR_MODULE, "Version": "13.2.0.100", "ModuleBase": "/opt/a"}),
            json!({"Name": DEPENDENT_MODULE, "Version": {"Major": 13, "Minor": 2, "Build": 0, "Revision": 100}, "ModuleBase": "/opt/b"}),
            json!({"Name": "Broken", "Version": {"Major": -1}}),
        ];

        let inventory = parse_inventory(&objects);
        assert_eq!(inventory.len(), 2);
        assert!(inventory[0].version.same_branch(&inventory[1].version));
    }
}
