//! Basic Tandem Example
//!
//! Two replicas edit concurrently, exchange updates and converge, then one
//! undoes its edit and both see presence for each other.
//!
//! Run with: cargo run --example basic

use std::time::Instant;

use tandem_core::{AwarenessRegistry, Decode, Document, Encode, UndoManager, Update, UserPresence};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Tandem Basic Example\n");

    println!("=== Concurrent edits ===\n");
    let (mut alice, mut bob) = concurrent_edits()?;

    println!("\n=== Undo ===\n");
    undo_example(&mut alice, &mut bob)?;

    println!("\n=== Presence ===\n");
    presence_example();

    println!("\nStart the server with: cargo run --bin tandemd");
    println!("and connect to ws://localhost:1234/<room>?userId=<id>");

    Ok(())
}

/// Send an update over a pretend wire
fn ship(update: &Update, to: &mut Document) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = update.encode_to_vec();
    let received = Update::decode_from_slice(&bytes)?;
    to.apply_remote_update(&received)?;
    Ok(())
}

fn concurrent_edits() -> Result<(Document, Document), Box<dyn std::error::Error>> {
    let mut alice = Document::new(1);
    let mut bob = Document::new(2);

    let hello = alice.apply_local_insert(0, "Hello")?;
    ship(&hello, &mut bob)?;

    // both type at the end at the same time
    let from_alice = alice.apply_local_insert(5, ", world")?;
    let from_bob = bob.apply_local_insert(5, "!")?;
    ship(&from_bob, &mut alice)?;
    ship(&from_alice, &mut bob)?;

    println!("Alice: {:?}", alice.current_text());
    println!("Bob:   {:?}", bob.current_text());
    assert_eq!(alice.current_text(), bob.current_text());

    // a late joiner catches up from its empty state vector
    let mut carol = Document::new(3);
    let diff = alice.compute_diff(&carol.state_vector());
    carol.apply_remote_update(&diff)?;
    println!("Carol: {:?} (synced from state vector)", carol.current_text());

    Ok((alice, bob))
}

fn undo_example(alice: &mut Document, bob: &mut Document) -> Result<(), Box<dyn std::error::Error>> {
    let mut undo = UndoManager::new();

    let edit = alice.apply_local_insert(0, ">> ")?;
    undo.record(&edit, alice);
    ship(&edit, bob)?;
    println!("After edit: {:?}", bob.current_text());

    if let Some(revert) = undo.undo(alice)? {
        ship(&revert, bob)?;
    }
    println!("After undo: {:?}", bob.current_text());
    println!("Tombstones kept for convergence: {}", bob.tombstone_count());

    Ok(())
}

fn presence_example() {
    let now = Instant::now();
    let mut server = AwarenessRegistry::new();
    server.on_change(|change| {
        tracing::info!(added = ?change.added, removed = ?change.removed, "presence changed");
    });

    let (_, update) = server.set_local("alice", UserPresence::named("Alice").with_color("#e06c75"), now);
    let mut bob_view = AwarenessRegistry::new();
    bob_view.apply_update(&update, now);
    bob_view.apply_update(&server.encode_all(), now);

    for (user, state) in bob_view.get_all() {
        println!("{user}: {:?} (clock {})", state.presence.display_name, state.clock);
    }

    let (_, gone) = server.remove_local("alice");
    bob_view.apply_update(&gone, now);
    println!("Users online after leave: {}", bob_view.len());
}
