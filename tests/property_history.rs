use std::collections::BTreeMap;

use proptest::prelude::*;
use viztrail::types::ModuleId;
use viztrail::viztrail::{EditOperation, ModuleState, ViztrailRepository};
use viztrail_test_utils::builders::plain;

#[derive(Debug, Clone, Copy)]
enum Edit {
    Append,
    Insert(usize),
    Delete(usize),
    Replace(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        2 => Just(Edit::Append),
        1 => any::<usize>().prop_map(Edit::Insert),
        1 => any::<usize>().prop_map(Edit::Delete),
        1 => any::<usize>().prop_map(Edit::Replace),
    ]
}

// Resolve an abstract edit against the current module ids. Edits that need
// an existing module fall back to an append on an empty workflow.
fn resolve(edit: Edit, ids: &[ModuleId], step: usize) -> (EditOperation, Option<usize>) {
    let command = plain(&format!("m{step}"));
    if ids.is_empty() {
        return (EditOperation::Append(command), None);
    }
    match edit {
        Edit::Append => (EditOperation::Append(command), None),
        Edit::Insert(i) => {
            let pos = i % ids.len();
            (
                EditOperation::Insert {
                    before: ids[pos].clone(),
                    command,
                },
                Some(pos),
            )
        }
        Edit::Delete(i) => {
            let pos = i % ids.len();
            (EditOperation::Delete { module: ids[pos].clone() }, Some(pos))
        }
        Edit::Replace(i) => {
            let pos = i % ids.len();
            (
                EditOperation::Replace {
                    module: ids[pos].clone(),
                    command,
                },
                Some(pos),
            )
        }
    }
}

proptest! {
    #[test]
    fn edits_only_ever_touch_the_head(edits in proptest::collection::vec(edit_strategy(), 1..12)) {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("prop", BTreeMap::new(), None).unwrap();
        let branch = vt.default_branch;

        for (step, edit) in edits.into_iter().enumerate() {
            let before = repo.get_history(&branch).unwrap();
            let ids: Vec<ModuleId> = before
                .last()
                .map(|h| h.modules.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default();

            let (op, pos) = resolve(edit, &ids, step);
            let is_delete = matches!(op, EditOperation::Delete { .. });
            let is_replace = matches!(op, EditOperation::Replace { .. });
            let outcome = repo.edit_branch(&branch, op, true).unwrap();
            let head = outcome.snapshot;

            let after = repo.get_history(&branch).unwrap();
            prop_assert_eq!(after.len(), before.len() + 1);
            prop_assert_eq!(&after[after.len() - 1], &head);

            // Everything older than the previous head is untouched.
            if before.len() > 1 {
                for (old, now) in before[..before.len() - 1].iter().zip(after.iter()) {
                    prop_assert_eq!(&**old, &**now);
                }
            }

            // The previous head keeps its identity and modules, even when frozen.
            if let Some(prev) = before.last() {
                let frozen = &after[before.len() - 1];
                prop_assert_eq!(&frozen.id, &prev.id);
                prop_assert!(frozen.revision >= prev.revision);
                let frozen_ids: Vec<&ModuleId> = frozen.modules.iter().map(|m| &m.id).collect();
                let prev_ids: Vec<&ModuleId> = prev.modules.iter().map(|m| &m.id).collect();
                prop_assert_eq!(frozen_ids, prev_ids);
                prop_assert!(frozen.modules.iter().all(|m| !m.state.is_pending()));
            }

            let head_ids: Vec<ModuleId> = head.modules.iter().map(|m| m.id.clone()).collect();
            match pos {
                None => {
                    prop_assert_eq!(head_ids.len(), ids.len() + 1);
                    prop_assert_eq!(&head_ids[..ids.len()], &ids[..]);
                }
                Some(p) if is_delete => {
                    let mut expected = ids.clone();
                    expected.remove(p);
                    prop_assert_eq!(head_ids, expected);
                }
                Some(p) if is_replace => {
                    prop_assert_eq!(head_ids.len(), ids.len());
                    prop_assert_ne!(&head_ids[p], &ids[p]);
                    prop_assert_eq!(&head_ids[..p], &ids[..p]);
                    prop_assert_eq!(&head_ids[p + 1..], &ids[p + 1..]);
                }
                Some(p) => {
                    prop_assert_eq!(head_ids.len(), ids.len() + 1);
                    prop_assert_eq!(&head_ids[..p], &ids[..p]);
                    prop_assert!(!ids.contains(&head_ids[p]));
                    prop_assert_eq!(&head_ids[p + 1..], &ids[p..]);
                }
            }

            // Nothing has run, so the whole head is waiting to be scheduled.
            prop_assert!(head.modules.iter().all(|m| m.state == ModuleState::Scheduled));
        }
    }
}
