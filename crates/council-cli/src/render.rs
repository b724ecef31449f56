//! Plain-text transcript rendering.
//!
//! ```text
//! === Session: brave-blue-fox ===
//! Participants: Alice, Bob
//!
//! --- #2 | Alice Joined ---
//!
//! --- #4 | Alice ---
//! Hi Bob.
//! --- End #4 | Alice | Next: Bob ---
//! ```

use council_client::SessionSnapshot;
use council_types::{Event, EventKind, MODERATOR};

/// Header plus every event with `number > after`.
pub fn transcript(snap: &SessionSnapshot, after: u64) -> String {
    let mut out = header(&snap.session_id, &snap.participants);
    out.push_str(&events(snap.events_after(after)));
    out
}

pub fn header(session_id: &str, participants: &[String]) -> String {
    let mut names: Vec<&str> = participants
        .iter()
        .map(String::as_str)
        .filter(|name| *name != MODERATOR)
        .collect();
    names.sort_unstable();

    let listed = if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    };
    format!("=== Session: {session_id} ===\nParticipants: {listed}\n\n")
}

pub fn events(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        push_event(&mut out, event);
    }
    out
}

fn push_event(out: &mut String, event: &Event) {
    let n = event.number;
    let who = event.participant().unwrap_or("?");
    match event.kind {
        EventKind::SessionCreated => {}
        EventKind::Joined => {
            if who != MODERATOR {
                out.push_str(&format!("--- #{n} | {who} Joined ---\n\n"));
            }
        }
        EventKind::Left => out.push_str(&format!("--- #{n} | {who} Left ---\n\n")),
        EventKind::Message => {
            let content = event.content.as_deref().unwrap_or_default();
            out.push_str(&format!("--- #{n} | {who} ---\n"));
            out.push_str(content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
            match event.next_hint() {
                Some(next) => out.push_str(&format!("--- End #{n} | {who} | Next: {next} ---\n\n")),
                None => out.push_str(&format!("--- End #{n} | {who} ---\n\n")),
            }
        }
    }
}
