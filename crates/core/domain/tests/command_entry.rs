use domain::{Address, CommandEntry, Direction, RegisterTable, RequestTemplate, WireType};

#[test]
fn command_entry_parses_from_table_json() {
    let raw = r#"{
        "name": "outside_temp",
        "address": { "kind": "register", "address": 50 },
        "wire_type": "signed-word",
        "direction": "read",
        "scale": { "factor": 0.1 },
        "block_id": "status"
    }"#;
    let entry: CommandEntry = serde_json::from_str(raw).expect("entry");

    assert_eq!(entry.name, "outside_temp");
    assert_eq!(entry.wire_type, WireType::SignedWord);
    assert_eq!(entry.direction, Direction::Read);
    assert_eq!(
        entry.address,
        Address::Register {
            table: RegisterTable::Holding,
            address: 0x32,
            bit: None,
            unit: None,
        }
    );
    assert!(entry.is_polled());
    assert!(entry.is_signed());
    assert_eq!(entry.register_count(), 1);
}

#[test]
fn direction_override_narrows() {
    assert_eq!(
        Direction::ReadWrite.narrow(Direction::Read),
        Some(Direction::Read)
    );
    assert_eq!(Direction::Read.narrow(Direction::Write), None);
    assert_eq!(Direction::parse("read-write"), Some(Direction::ReadWrite));
    assert_eq!(Direction::parse("sideways"), None);
}

#[test]
fn unsigned_word_becomes_signed_with_negative_bound() {
    let entry = CommandEntry::new(
        "offset",
        Address::Register {
            table: RegisterTable::Holding,
            address: 1,
            bit: None,
            unit: None,
        },
        WireType::Word,
    );
    assert!(!entry.is_signed());
    assert!(entry.with_range(-50.0, 50.0).is_signed());
}

#[test]
fn request_template_renders_value() {
    let template = RequestTemplate::Http {
        method: domain::HttpMethod::Get,
        path: "/YamahaExtendedControl/v1/main/setVolume?volume={value}".to_string(),
        body: None,
    };
    match template.render("28") {
        RequestTemplate::Http { path, .. } => {
            assert!(path.ends_with("volume=28"));
        }
        other => panic!("unexpected template {:?}", other),
    }
}

#[test]
fn topic_entries_are_not_polled() {
    let entry = CommandEntry::new(
        "power",
        Address::Topic {
            state: "tele/plug/state".to_string(),
            command: Some("cmnd/plug/power".to_string()),
        },
        WireType::BoolPair,
    );
    assert!(!entry.is_polled());
}
