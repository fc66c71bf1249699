use proptest::prelude::*;
use tandem_core::{Decode, Document, Encode, StateVector, Update};

const REPLICAS: u64 = 3;

#[derive(Debug, Clone)]
enum Edit {
    Insert { replica: usize, pos: usize, text: String },
    Delete { replica: usize, pos: usize, len: usize },
    Sync { from: usize, to: usize },
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    let replica = 0..REPLICAS as usize;
    prop_oneof![
        4 => (replica.clone(), any::<usize>(), "[a-z0-9 \n]{1,6}")
            .prop_map(|(replica, pos, text)| Edit::Insert { replica, pos, text }),
        2 => (replica.clone(), any::<usize>(), 1usize..4)
            .prop_map(|(replica, pos, len)| Edit::Delete { replica, pos, len }),
        1 => (replica.clone(), replica)
            .prop_map(|(from, to)| Edit::Sync { from, to }),
    ]
}

fn sync_docs(docs: &mut [Document], from: usize, to: usize) {
    if from == to {
        return;
    }
    let target_sv = docs[to].state_vector();
    let diff = docs[from].compute_diff(&target_sv);
    // every diff goes through the wire encoding
    let bytes = diff.encode_to_vec();
    let decoded = Update::decode_from_slice(&bytes).expect("diff should decode");
    docs[to].apply_remote_update(&decoded).expect("diff should apply");
}

fn settle_all(docs: &mut [Document]) {
    for _ in 0..2 {
        for from in 0..docs.len() {
            for to in 0..docs.len() {
                sync_docs(docs, from, to);
            }
        }
    }
}

fn apply_edit(docs: &mut [Document], edit: &Edit) {
    match edit {
        Edit::Insert { replica, pos, text } => {
            let doc = &mut docs[*replica];
            let pos = pos % (doc.len() + 1);
            doc.apply_local_insert(pos, text).expect("insert in range");
        }
        Edit::Delete { replica, pos, len } => {
            let doc = &mut docs[*replica];
            if doc.is_empty() {
                return;
            }
            let start = pos % doc.len();
            let end = (start + len).min(doc.len());
            doc.apply_local_delete(start..end).expect("delete in range");
        }
        Edit::Sync { from, to } => sync_docs(docs, *from, *to),
    }
}

fn new_docs() -> Vec<Document> {
    (1..=REPLICAS).map(Document::new).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn replicas_converge_after_full_sync(edits in prop::collection::vec(edit_strategy(), 1..60)) {
        let mut docs = new_docs();
        for edit in &edits {
            apply_edit(&mut docs, edit);
        }
        settle_all(&mut docs);

        let expected = docs[0].current_text();
        for doc in &docs[1..] {
            prop_assert_eq!(doc.current_text(), expected.clone());
            prop_assert_eq!(doc.state_vector(), docs[0].state_vector());
        }
        for doc in &docs {
            prop_assert_eq!(doc.pending_count(), 0);
        }
    }

    #[test]
    fn delivery_order_does_not_matter(
        edits in prop::collection::vec(edit_strategy(), 1..40),
        seed in any::<u64>(),
    ) {
        let mut docs = new_docs();
        for edit in &edits {
            apply_edit(&mut docs, edit);
        }

        // Everything each replica authored, one operation per update
        let mut ops = Vec::new();
        for doc in &docs {
            let own = doc.compute_diff(&StateVector::new());
            ops.extend(
                own.into_ops()
                    .into_iter()
                    .filter(|op| op.id().replica == doc.replica_id()),
            );
        }

        let mut in_order = Document::new(99);
        in_order.apply_remote_update(&Update::new(ops.clone())).unwrap();

        // deterministic shuffle
        let mut state = seed | 1;
        for i in (1..ops.len()).rev() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            ops.swap(i, j);
        }
        let mut shuffled = Document::new(100);
        for op in ops {
            shuffled.apply_remote_update(&Update::new(vec![op])).unwrap();
        }

        prop_assert_eq!(shuffled.pending_count(), 0);
        prop_assert_eq!(shuffled.current_text(), in_order.current_text());
    }

    #[test]
    fn reapplying_a_diff_is_a_no_op(edits in prop::collection::vec(edit_strategy(), 1..40)) {
        let mut docs = new_docs();
        for edit in &edits {
            apply_edit(&mut docs, edit);
        }
        settle_all(&mut docs);

        let full = docs[0].encode_state_as_update();
        let before = docs[1].current_text();
        let changes = docs[1].apply_remote_update(&full).unwrap();
        prop_assert!(changes.is_empty());
        prop_assert_eq!(docs[1].current_text(), before);
    }

    #[test]
    fn compaction_preserves_convergence(edits in prop::collection::vec(edit_strategy(), 1..40)) {
        let mut docs = new_docs();
        for edit in &edits {
            apply_edit(&mut docs, edit);
        }
        settle_all(&mut docs);

        let stable = docs[0].state_vector();
        docs[0].compact(&stable);

        // a late joiner syncs from the compacted replica
        let mut late = Document::new(50);
        late.apply_remote_update(&docs[0].encode_state_as_update()).unwrap();
        prop_assert_eq!(late.current_text(), docs[1].current_text());

        let edit = late.apply_local_insert(late.len(), "!").unwrap();
        for doc in docs.iter_mut() {
            doc.apply_remote_update(&edit).unwrap();
        }
        prop_assert_eq!(docs[0].current_text(), late.current_text());
        prop_assert_eq!(docs[2].current_text(), late.current_text());
    }
}
