// crates/arborruntime/tests/tree_test.rs

mod common;

use arborcore::{FlowError, TreeError, WorkflowEvent};
use arborruntime::tree::{self, validate_tree};
use arborruntime::Workflow;
use common::{init_tracing, RecordingObserver};

fn assert_mirrored(root: &Workflow) {
    let violations = tree::validate_tree(root);
    assert!(violations.is_empty(), "tree violations: {:?}", violations);
}

#[test]
fn test_attach_and_detach_keep_both_trees_in_step() {
    init_tracing();

    let root = Workflow::new("root");
    let child = Workflow::new("child");

    root.attach_child(&child).unwrap();
    assert!(root.has_child(&child));
    assert!(child.parent().unwrap().ptr_eq(&root));
    assert!(root.node().contains_child(child.node()));
    assert_eq!(child.node().parent_id(), Some(root.id()));
    assert_mirrored(&root);

    root.detach_child(&child).unwrap();
    assert!(!root.has_child(&child));
    assert!(child.is_root());
    assert!(!root.node().contains_child(child.node()));
    assert_eq!(child.node().parent_id(), None);
    assert_mirrored(&root);
    assert_mirrored(&child);
}

#[test]
fn test_children_keep_attach_order() {
    let root = Workflow::new("root");
    let names = ["first", "second", "third"];
    for name in names {
        Workflow::child_of(&root, name).unwrap();
    }

    let live: Vec<_> = root.children().iter().map(|c| c.name().to_string()).collect();
    let data: Vec<_> = root.node().children().iter().map(|n| n.name()).collect();
    assert_eq!(live, names);
    assert_eq!(data, names);
    assert_mirrored(&root);
}

#[test]
fn test_attaching_ancestor_is_circular_and_changes_nothing() {
    let a = Workflow::new("a");
    let b = Workflow::child_of(&a, "b").unwrap();
    let c = Workflow::child_of(&b, "c").unwrap();

    let error = c.attach_child(&a).unwrap_err();
    assert!(matches!(
        error,
        FlowError::Tree(TreeError::CircularReference { .. })
    ));
    assert!(c.children().is_empty());
    assert!(c.node().children().is_empty());
    assert!(a.is_root());
    assert_eq!(a.node().parent_id(), None);
    assert_mirrored(&a);

    let error = a.attach_child(&a).unwrap_err();
    assert!(matches!(
        error,
        FlowError::Tree(TreeError::CircularReference { .. })
    ));
    assert_mirrored(&a);
}

#[test]
fn test_parented_child_cannot_be_attached_elsewhere() {
    let first = Workflow::new("first");
    let second = Workflow::new("second");
    let child = Workflow::child_of(&first, "child").unwrap();

    let error = second.attach_child(&child).unwrap_err();
    match &error {
        FlowError::Tree(TreeError::ParentConflict { current_parent, .. }) => {
            assert_eq!(current_parent, &first.label());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(error.to_string().contains("detach_child()"));

    assert!(second.children().is_empty());
    assert!(second.node().children().is_empty());
    assert!(child.parent().unwrap().ptr_eq(&first));
    assert_eq!(child.node().parent_id(), Some(first.id()));
    assert_mirrored(&first);
    assert_mirrored(&second);
}

#[test]
fn test_reparent_by_detaching_first() {
    let first = Workflow::new("first");
    let second = Workflow::new("second");
    let child = Workflow::child_of(&first, "child").unwrap();

    first.detach_child(&child).unwrap();
    second.attach_child(&child).unwrap();

    assert!(child.parent().unwrap().ptr_eq(&second));
    assert_eq!(child.node().parent_id(), Some(second.id()));
    assert!(first.children().is_empty());
    assert_mirrored(&first);
    assert_mirrored(&second);
}

#[test]
fn test_double_attach_and_unknown_detach_are_rejected() {
    let root = Workflow::new("root");
    let child = Workflow::child_of(&root, "child").unwrap();
    let stranger = Workflow::new("stranger");

    assert!(matches!(
        root.attach_child(&child),
        Err(FlowError::Tree(TreeError::AlreadyAttached { .. }))
    ));
    assert!(matches!(
        root.detach_child(&stranger),
        Err(FlowError::Tree(TreeError::NotAttached { .. }))
    ));
    assert_eq!(root.children().len(), 1);
    assert_eq!(root.node().children().len(), 1);
}

#[test]
fn test_observers_only_on_root() {
    let root = Workflow::new("root");
    let child = Workflow::child_of(&root, "child").unwrap();

    assert!(matches!(
        child.add_observer(RecordingObserver::new()),
        Err(FlowError::Tree(TreeError::NotRoot { .. }))
    ));
    assert!(root.add_observer(RecordingObserver::new()).is_ok());
}

#[test]
fn test_attach_and_detach_are_announced_to_root() {
    let root = Workflow::new("root");
    let observer = RecordingObserver::new();
    root.add_observer(observer.clone()).unwrap();

    let middle = Workflow::child_of(&root, "middle").unwrap();
    let leaf = Workflow::child_of(&middle, "leaf").unwrap();
    middle.detach_child(&leaf).unwrap();

    let events = observer.events();
    assert_eq!(observer.event_kinds(), vec!["child_attached", "child_attached", "child_detached"]);
    match &events[1] {
        WorkflowEvent::ChildAttached {
            parent_id,
            child_id,
            child_name,
        } => {
            assert_eq!(*parent_id, middle.id());
            assert_eq!(*child_id, leaf.id());
            assert_eq!(child_name, "leaf");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(observer.tree_changes(), vec![root.id(); 3]);

    // Events land on the node that emitted them
    assert_eq!(middle.node().events().len(), 2);
}

#[test]
fn test_outliving_the_root_keeps_both_trees_in_step() {
    let root = Workflow::new("root");
    let child = Workflow::child_of(&root, "child").unwrap();
    let leaf = Workflow::child_of(&child, "leaf").unwrap();
    let observer = RecordingObserver::new();
    root.add_observer(observer.clone()).unwrap();
    let root_id = root.id();
    assert_eq!(child.node().parent_id(), Some(root_id));

    drop(root);

    assert!(child.parent().is_none());
    assert_eq!(child.node().parent_id(), None);
    assert!(child.is_root());
    assert!(validate_tree(&child).is_empty());
    assert!(tree::get_root(&leaf).unwrap().ptr_eq(&child));

    // The orphaned subtree is independent: the old root's observers no longer hear it
    observer.clear();
    leaf.info("after the root is gone");
    assert!(observer.logs().is_empty());
    assert!(child.add_observer(RecordingObserver::new()).is_ok());
}
