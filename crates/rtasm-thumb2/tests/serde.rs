#![cfg(feature = "serde")]
//! Serde round-trips for the public value types.

use rtasm_thumb2::{Action, Error, PcLookup, Pos};

#[test]
fn error_round_trip() {
    let err = Error::ImmediateRange { action: 12 };
    let json = serde_json::to_string(&err).unwrap();
    let back: Error = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
    assert_eq!(back.code(), 0x1100_000C);
}

#[test]
fn action_round_trip() {
    let action = Action::VrList;
    let json = serde_json::to_string(&action).unwrap();
    let back: Action = serde_json::from_str(&json).unwrap();
    assert_eq!(back, action);
}

#[test]
fn pos_round_trip() {
    let pos = Pos::new(2, 0x42);
    let json = serde_json::to_string(&pos).unwrap();
    let back: Pos = serde_json::from_str(&json).unwrap();
    assert_eq!(back, pos);
}

#[test]
fn pc_lookup_round_trip() {
    for lookup in [PcLookup::Defined(16), PcLookup::Undefined, PcLookup::Unused] {
        let json = serde_json::to_string(&lookup).unwrap();
        let back: PcLookup = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lookup);
    }
}
