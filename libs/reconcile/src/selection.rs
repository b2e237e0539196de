//! Instance classification and deterministic termination selection.

use fleet_events::InstanceStatus;
use fleet_id::InstanceId;

use crate::RevisionHash;

/// The slice of an instance record the convergence math needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub revision: RevisionHash,
}

/// Partitions owned instances into current-revision and superseded sets.
pub fn classify_instances(
    instances: Vec<InstanceView>,
    desired_revision: &RevisionHash,
) -> (Vec<InstanceView>, Vec<InstanceView>) {
    let mut current = Vec::new();
    let mut old = Vec::new();

    for instance in instances {
        if &instance.revision == desired_revision {
            current.push(instance);
        } else {
            old.push(instance);
        }
    }

    (current, old)
}

/// Termination priority class. Lower terminates first.
fn termination_class(status: InstanceStatus) -> u8 {
    match status {
        InstanceStatus::Failed => 0,
        // Least invested: not yet serving traffic.
        InstanceStatus::Pending | InstanceStatus::Starting => 1,
        InstanceStatus::Ready => 2,
        // Already on the way out; callers exclude these.
        InstanceStatus::Terminating | InstanceStatus::Terminated => 3,
    }
}

/// Sorts instances into deterministic termination order.
///
/// Failed first, then Pending/Starting, then Ready; within a class the
/// newest instance (ULID descending) goes first, so scale-down prefers
/// the least-invested instances and protects the longest-serving ready
/// ones. Callers take at most the computed surplus off the front.
pub fn termination_order(mut instances: Vec<InstanceView>) -> Vec<InstanceView> {
    instances.sort_by(|a, b| {
        termination_class(a.status)
            .cmp(&termination_class(b.status))
            .then(b.id.cmp(&a.id))
    });
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: InstanceId, status: InstanceStatus, revision: &RevisionHash) -> InstanceView {
        InstanceView {
            id,
            status,
            revision: revision.clone(),
        }
    }

    fn rev(tag: &str) -> RevisionHash {
        RevisionHash::from_template(&serde_json::json!({ "image": tag }))
    }

    #[test]
    fn test_classify_splits_by_revision() {
        let cur = rev("v2");
        let old = rev("v1");
        let instances = vec![
            view(InstanceId::new(), InstanceStatus::Ready, &cur),
            view(InstanceId::new(), InstanceStatus::Ready, &old),
            view(InstanceId::new(), InstanceStatus::Starting, &cur),
        ];

        let (matching, superseded) = classify_instances(instances, &cur);
        assert_eq!(matching.len(), 2);
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].revision, old);
    }

    #[test]
    fn test_failed_terminate_first() {
        let revision = rev("v1");
        let ready = view(InstanceId::new(), InstanceStatus::Ready, &revision);
        let failed = view(InstanceId::new(), InstanceStatus::Failed, &revision);
        let starting = view(InstanceId::new(), InstanceStatus::Starting, &revision);

        let ordered = termination_order(vec![ready.clone(), failed.clone(), starting.clone()]);
        assert_eq!(ordered[0].id, failed.id);
        assert_eq!(ordered[1].id, starting.id);
        assert_eq!(ordered[2].id, ready.id);
    }

    #[test]
    fn test_newest_first_within_class() {
        let revision = rev("v1");
        let older = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = InstanceId::new();

        let ordered = termination_order(vec![
            view(older, InstanceStatus::Ready, &revision),
            view(newer, InstanceStatus::Ready, &revision),
        ]);
        assert_eq!(ordered[0].id, newer);
        assert_eq!(ordered[1].id, older);
    }

    #[test]
    fn test_order_is_deterministic() {
        let revision = rev("v1");
        let instances: Vec<InstanceView> = (0..6)
            .map(|i| {
                let status = match i % 3 {
                    0 => InstanceStatus::Ready,
                    1 => InstanceStatus::Failed,
                    _ => InstanceStatus::Pending,
                };
                view(InstanceId::new(), status, &revision)
            })
            .collect();

        let first = termination_order(instances.clone());
        let second = termination_order(instances);
        assert_eq!(first, second);
    }
}
