//! Comparing the last deployed APKs with freshly built ones

use std::collections::{BTreeMap, BTreeSet};

use crate::apk::ApkSnapshot;
use crate::error::{DeployErrorKind, DeployerError, DeployerResult};

/// What a swap has to apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapPlan {
    /// Classes whose hash changed or that are new, sorted
    pub changed_classes: Vec<String>,
    /// APKs whose file digest changed, in package order
    pub changed_apks: Vec<String>,
    pub resources_changed: bool,
}

impl SwapPlan {
    /// Every APK is byte for byte the one deployed last.
    ///
    /// A changed APK is never a no-op, even when no class or resource
    /// difference was found: the device has to end up with the new files.
    pub fn is_noop(&self) -> bool {
        self.changed_apks.is_empty()
    }
}

/// True when both sets hold the same APK files, byte for byte
pub fn same_contents(previous: &[ApkSnapshot], current: &[ApkSnapshot]) -> bool {
    let digests = |apks: &[ApkSnapshot]| -> BTreeMap<String, String> {
        apks.iter()
            .map(|a| (a.name.clone(), a.digest.clone()))
            .collect()
    };
    previous.len() == current.len() && digests(previous) == digests(current)
}

/// Work out what changed between `previous` and `current`.
///
/// Fails when the change cannot be applied to a running process: a different
/// split set, a manifest change, a removed class, or (unless
/// `allow_resources`) a resource change.
pub fn plan_swap(
    previous: &[ApkSnapshot],
    current: &[ApkSnapshot],
    allow_resources: bool,
) -> DeployerResult<SwapPlan> {
    let previous_by_name: BTreeMap<&str, &ApkSnapshot> =
        previous.iter().map(|a| (a.name.as_str(), a)).collect();
    let previous_names: BTreeSet<&str> = previous_by_name.keys().copied().collect();
    let current_names: BTreeSet<&str> = current.iter().map(|a| a.name.as_str()).collect();

    if previous_names != current_names {
        return Err(DeployerError::new(
            DeployErrorKind::DifferentApkSet,
            format!(
                "The set of APKs changed ({} installed, {} built).",
                previous_names.len(),
                current_names.len()
            ),
        )
        .with_details(format!(
            "installed: {:?}\nbuilt: {:?}",
            previous_names, current_names
        )));
    }

    let mut plan = SwapPlan::default();
    let mut changed_classes = BTreeSet::new();

    for apk in current {
        // names are equal sets, the lookup cannot miss
        let Some(old) = previous_by_name.get(apk.name.as_str()) else {
            continue;
        };
        if old.digest == apk.digest {
            continue;
        }
        plan.changed_apks.push(apk.name.clone());

        if old.manifest_crc != apk.manifest_crc {
            return Err(DeployerError::new(
                DeployErrorKind::ManifestChanged,
                format!("AndroidManifest.xml changed in {}.", apk.name),
            ));
        }

        if let Some(removed) = old.classes.keys().find(|c| !apk.classes.contains_key(*c)) {
            return Err(DeployerError::new(
                DeployErrorKind::ClassRemoved,
                format!("Removing class {} is not supported without a restart.", removed),
            ));
        }

        for (class, hash) in &apk.classes {
            if old.classes.get(class) != Some(hash) {
                changed_classes.insert(class.clone());
            }
        }

        if old.resources != apk.resources {
            plan.resources_changed = true;
        }
    }

    if plan.resources_changed && !allow_resources {
        return Err(DeployerError::new(
            DeployErrorKind::ResourceModificationNotAllowed,
            "Modifying resources requires swapping code and resources together.",
        ));
    }

    plan.changed_classes = changed_classes.into_iter().collect();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apk(name: &str, classes: &[(&str, &str)], resources: &[(&str, u32)]) -> ApkSnapshot {
        let mut snapshot = ApkSnapshot {
            name: name.to_string(),
            digest: String::new(),
            classes: classes
                .iter()
                .map(|(c, h)| (c.to_string(), h.to_string()))
                .collect(),
            resources: resources.iter().map(|(r, c)| (r.to_string(), *c)).collect(),
            manifest_crc: Some(7),
        };
        snapshot.digest = format!("{:?}{:?}", snapshot.classes, snapshot.resources);
        snapshot
    }

    #[test]
    fn test_unchanged_is_noop() {
        let a = vec![apk("base.apk", &[("LA;", "1")], &[])];
        let plan = plan_swap(&a, &a, false).unwrap();
        assert!(plan.is_noop());
        assert!(plan.changed_apks.is_empty());
        assert!(same_contents(&a, &a));
    }

    #[test]
    fn test_changed_and_added_classes() {
        let old = vec![apk("base.apk", &[("LA;", "1"), ("LB;", "1")], &[])];
        let new = vec![apk(
            "base.apk",
            &[("LA;", "2"), ("LB;", "1"), ("LC;", "1")],
            &[],
        )];
        let plan = plan_swap(&old, &new, false).unwrap();
        assert_eq!(plan.changed_classes, vec!["LA;", "LC;"]);
        assert_eq!(plan.changed_apks, vec!["base.apk"]);
        assert!(!same_contents(&old, &new));
    }

    #[test]
    fn test_changed_apk_without_class_difference_is_not_noop() {
        let old = vec![apk("base.apk", &[("LA;", "1")], &[])];
        let mut new = old.clone();
        new[0].digest = "rebuilt".to_string();

        let plan = plan_swap(&old, &new, false).unwrap();
        assert!(plan.changed_classes.is_empty());
        assert_eq!(plan.changed_apks, vec!["base.apk"]);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_removed_class_rejected() {
        let old = vec![apk("base.apk", &[("LA;", "1"), ("LB;", "1")], &[])];
        let new = vec![apk("base.apk", &[("LA;", "1")], &[])];
        let err = plan_swap(&old, &new, true).unwrap_err();
        assert_eq!(err.kind, DeployErrorKind::ClassRemoved);
        assert!(err.message.contains("LB;"));
    }

    #[test]
    fn test_resources_need_full_swap() {
        let old = vec![apk("base.apk", &[("LA;", "1")], &[("res/a.xml", 1)])];
        let new = vec![apk("base.apk", &[("LA;", "1")], &[("res/a.xml", 2)])];

        let err = plan_swap(&old, &new, false).unwrap_err();
        assert_eq!(err.kind, DeployErrorKind::ResourceModificationNotAllowed);

        let plan = plan_swap(&old, &new, true).unwrap();
        assert!(plan.resources_changed);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_manifest_change_rejected() {
        let old = vec![apk("base.apk", &[("LA;", "1")], &[])];
        let mut new = vec![apk("base.apk", &[("LA;", "2")], &[])];
        new[0].manifest_crc = Some(8);
        let err = plan_swap(&old, &new, true).unwrap_err();
        assert_eq!(err.kind, DeployErrorKind::ManifestChanged);
    }

    #[test]
    fn test_split_set_change_rejected() {
        let old = vec![apk("base.apk", &[], &[])];
        let new = vec![apk("base.apk", &[], &[]), apk("split_a.apk", &[], &[])];
        let err = plan_swap(&old, &new, true).unwrap_err();
        assert_eq!(err.kind, DeployErrorKind::DifferentApkSet);
    }
}
