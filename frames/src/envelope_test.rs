use super::*;

fn feed_bytewise(input: &[u8]) -> Vec<EnvelopeFrame> {
    let mut pending = Vec::new();
    let mut frames = Vec::new();
    for &byte in input {
        pending.push(byte);
        let parsed = parse(&pending);
        let closed = parsed.is_closed();
        frames.extend(parsed.frames);
        pending = parsed.remainder;
        if closed {
            break;
        }
    }
    frames
}

fn message(text: &str) -> EnvelopeFrame {
    EnvelopeFrame::Message(text.to_owned())
}

#[test]
fn parse_open_frame() {
    let parsed = parse(b"o");
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Open]);
    assert!(parsed.remainder.is_empty());
    assert!(parsed.errors.is_empty());
}

#[test]
fn parse_consecutive_bodyless_frames() {
    let parsed = parse(b"ohh");
    assert_eq!(
        parsed.frames,
        vec![
            EnvelopeFrame::Open,
            EnvelopeFrame::Heartbeat,
            EnvelopeFrame::Heartbeat
        ]
    );
}

#[test]
fn parse_expands_batched_array_in_order() {
    let parsed = parse(br#"a["first","second","third"]"#);
    assert_eq!(
        parsed.frames,
        vec![message("first"), message("second"), message("third")]
    );
    assert!(parsed.remainder.is_empty());
}

#[test]
fn parse_decodes_json_escapes_in_messages() {
    let parsed = parse(br#"a["CONNECTED\n\n\n\u0000"]"#);
    assert_eq!(parsed.frames, vec![message("CONNECTED\n\n\n\0")]);
}

#[test]
fn parse_incomplete_array_returns_whole_input() {
    let input = br#"a["MESSAGE\ndestination:/x\n\n{\"te"#;
    let parsed = parse(input);
    assert!(parsed.frames.is_empty());
    assert_eq!(parsed.remainder, input.to_vec());
}

#[test]
fn parse_lone_array_opcode_waits_for_more() {
    let parsed = parse(b"a");
    assert!(parsed.frames.is_empty());
    assert_eq!(parsed.remainder, b"a".to_vec());
}

#[test]
fn parse_keeps_earlier_frames_before_incomplete_array() {
    let parsed = parse(br#"oa["par"#);
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Open]);
    assert_eq!(parsed.remainder, br#"a["par"#.to_vec());
}

#[test]
fn parse_brackets_inside_strings_do_not_end_array() {
    let parsed = parse(br#"a["x]y","[z"]"#);
    assert_eq!(parsed.frames, vec![message("x]y"), message("[z")]);
}

#[test]
fn parse_escaped_quote_inside_string() {
    let parsed = parse(br#"a["say \"hi\"]"]"#);
    assert_eq!(parsed.frames, vec![message("say \"hi\"]")]);
}

#[test]
fn parse_skips_newline_separators() {
    let parsed = parse(b"o\nh\na[\"x\"]\n");
    assert_eq!(
        parsed.frames,
        vec![EnvelopeFrame::Open, EnvelopeFrame::Heartbeat, message("x")]
    );
    assert!(parsed.remainder.is_empty());
    assert!(parsed.errors.is_empty());
}

#[test]
fn parse_close_frame_is_terminal() {
    let parsed = parse(br#"c[3000,"Go away!"]o"#);
    assert_eq!(
        parsed.frames,
        vec![EnvelopeFrame::Close(CloseReason::new(3000, "Go away!"))]
    );
    assert!(parsed.is_closed());
    assert_eq!(parsed.remainder, b"o".to_vec());
}

#[test]
fn parse_malformed_close_payload_still_closes() {
    let parsed = parse(br#"c["oops"]"#);
    assert!(parsed.is_closed());
    assert_eq!(parsed.errors.len(), 1);
}

#[test]
fn parse_unknown_opcode_resyncs() {
    let parsed = parse(b"xyz\no");
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Open]);
    assert!(parsed.remainder.is_empty());
    assert_eq!(parsed.errors.len(), 1);
    assert!(matches!(
        &parsed.errors[0],
        FramingError::UnknownOpcode { skipped } if skipped == "xyz"
    ));
}

#[test]
fn parse_word_starting_with_opcodes_is_skipped_whole() {
    let parsed = parse(b"hello");
    assert!(parsed.frames.is_empty());
    assert!(parsed.remainder.is_empty());
    assert!(matches!(
        &parsed.errors[..],
        [FramingError::UnknownOpcode { skipped }] if skipped == "hello"
    ));
}

#[test]
fn parse_skipped_run_ends_at_newline() {
    let parsed = parse(b"wow\nh\n");
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Heartbeat]);
    assert!(matches!(
        &parsed.errors[..],
        [FramingError::UnknownOpcode { skipped }] if skipped == "wow"
    ));
}

#[test]
fn parse_skipped_run_ends_at_array_start() {
    let parsed = parse(br#"za["x"]"#);
    assert_eq!(parsed.frames, vec![message("x")]);
    assert!(matches!(
        &parsed.errors[..],
        [FramingError::UnknownOpcode { skipped }] if skipped == "z"
    ));

    let parsed = parse(br#"zzc[1000,"bye"]"#);
    assert_eq!(
        parsed.frames,
        vec![EnvelopeFrame::Close(CloseReason::new(1000, "bye"))]
    );
    assert!(matches!(
        &parsed.errors[..],
        [FramingError::UnknownOpcode { skipped }] if skipped == "zz"
    ));
}

#[test]
fn parse_skipped_run_keeps_trailing_array_opcode() {
    let parsed = parse(b"xyza");
    assert!(parsed.frames.is_empty());
    assert_eq!(parsed.remainder, b"a".to_vec());
    assert!(matches!(
        &parsed.errors[..],
        [FramingError::UnknownOpcode { skipped }] if skipped == "xyz"
    ));
}

#[test]
fn parse_single_message_frame_is_reported_and_skipped() {
    let parsed = parse(br#"m"hello"o"#);
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Open]);
    assert!(matches!(parsed.errors[..], [FramingError::SingleMessage]));
}

#[test]
fn parse_non_string_array_items_are_reported() {
    let parsed = parse(b"a[1,2]h");
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Heartbeat]);
    assert!(matches!(
        parsed.errors[..],
        [FramingError::InvalidPayload { opcode: 'a', .. }]
    ));
}

#[test]
fn parse_array_opcode_without_bracket_is_reported() {
    let parsed = parse(b"ax\no");
    assert_eq!(parsed.frames, vec![EnvelopeFrame::Open]);
    assert!(matches!(parsed.errors[0], FramingError::MissingArray('a')));
}

#[test]
fn bytewise_feed_matches_whole_feed() {
    let input = "o\nh\na[\"CONNECTED\\n\\n\\n\\u0000\"]\na[\"one\",\"tw\\\"o\"]hh\
                 a[\"MESSAGE\\ndestination:/exchange/abc123.messages\\n\\n{}\\u0000\"]\
                 c[3000,\"Go away!\"]";
    let whole = parse(input.as_bytes()).frames;
    assert_eq!(whole.len(), 9);
    assert_eq!(feed_bytewise(input.as_bytes()), whole);
}

#[test]
fn bytewise_feed_handles_multibyte_text() {
    let input = "a[\"caf\u{e9} \u{1f600}\"]";
    assert_eq!(
        feed_bytewise(input.as_bytes()),
        vec![message("caf\u{e9} \u{1f600}")]
    );
}

#[test]
fn wrap_produces_single_element_array() {
    assert_eq!(wrap("SEND\n\nhi\0"), r#"["SEND\n\nhi\u0000"]"#);
}

#[test]
fn wrap_escapes_embedded_json() {
    let wrapped = wrap("SEND\n\n{\"text\":\"hi\"}\0");
    let decoded: Vec<String> = serde_json::from_str(&wrapped).expect("valid array");
    assert_eq!(decoded, vec!["SEND\n\n{\"text\":\"hi\"}\0".to_owned()]);
}

#[test]
fn wrap_round_trips_control_and_multibyte_text() {
    let text = "SEND\ndestination:/exchange/abc123.messages\n\n\u{1}caf\u{e9} \u{1f600}\0";
    let wrapped = wrap(text);
    assert!(wrapped.starts_with("[\"") && wrapped.ends_with("\"]"));
    let parsed = parse(format!("a{wrapped}").as_bytes());
    assert_eq!(parsed.frames, vec![message(text)]);
}

#[test]
fn opcode_reports_wire_byte() {
    assert_eq!(EnvelopeFrame::Open.opcode(), 'o');
    assert_eq!(EnvelopeFrame::Heartbeat.opcode(), 'h');
    assert_eq!(message("x").opcode(), 'a');
    assert_eq!(
        EnvelopeFrame::Close(CloseReason::new(1000, "bye")).opcode(),
        'c'
    );
}
