//! RESP protocol tests

use roomdb::resp::{extract_command, parse_resp, RespError, RespParser, RespValue};

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_parse_simple_string() {
  let result = parse_resp(b"+OK\r\n").unwrap();
  assert_eq!(result, RespValue::SimpleString("OK".to_string()));
}

#[test]
fn test_parse_error() {
  let result = parse_resp(b"-ERR unknown command\r\n").unwrap();
  assert_eq!(result, RespValue::Error("ERR unknown command".to_string()));
}

#[test]
fn test_parse_integer() {
  let result = parse_resp(b":42\r\n").unwrap();
  assert_eq!(result, RespValue::Integer(42));
}

#[test]
fn test_parse_bulk_string() {
  let result = parse_resp(b"$5\r\nhello\r\n").unwrap();
  assert_eq!(result, RespValue::BulkString(Some("hello".to_string())));
}

#[test]
fn test_parse_null_bulk() {
  let result = parse_resp(b"$-1\r\n").unwrap();
  assert_eq!(result, RespValue::BulkString(None));
}

#[test]
fn test_parse_null_array() {
  let result = parse_resp(b"*-1\r\n").unwrap();
  assert_eq!(result, RespValue::Array(None));
}

#[test]
fn test_parse_command_array() {
  let result = parse_resp(b"*2\r\n$3\r\nGET\r\n$10\r\n{u42}:name\r\n").unwrap();
  let (cmd, args) = extract_command(&result).unwrap();
  assert_eq!(cmd, "GET");
  assert_eq!(args, vec!["{u42}:name"]);
}

#[test]
fn test_parse_invalid_integer() {
  assert!(parse_resp(b":abc\r\n").is_err());
}

// =============================================================================
// Encoding
// =============================================================================

#[test]
fn test_encode_roundtrip() {
  let values = vec![
    RespValue::ok(),
    RespValue::error("ERR test"),
    RespValue::integer(123),
    RespValue::bulk("hello"),
    RespValue::null_bulk(),
    RespValue::null_array(),
    RespValue::array(vec![
      RespValue::bulk("SET"),
      RespValue::bulk("key"),
      RespValue::bulk("value"),
    ]),
  ];

  for original in values {
    let encoded = original.encode();
    let parsed = parse_resp(&encoded).unwrap();
    assert_eq!(original, parsed);
  }
}

#[test]
fn test_encode_nested_array() {
  let value = RespValue::array(vec![
    RespValue::array(vec![RespValue::integer(1), RespValue::integer(2)]),
    RespValue::null_bulk(),
  ]);
  let parsed = parse_resp(&value.encode()).unwrap();
  assert_eq!(parsed, value);
}

// =============================================================================
// Incremental parsing
// =============================================================================

#[test]
fn test_incremental_feed() {
  let mut parser = RespParser::new();

  parser.feed(b"*2\r\n$3\r\nGE");
  assert!(parser.parse().unwrap().is_none());

  parser.feed(b"T\r\n$3\r\nfoo\r\n");
  let value = parser.parse().unwrap().unwrap();
  let (cmd, args) = extract_command(&value).unwrap();
  assert_eq!(cmd, "GET");
  assert_eq!(args, vec!["foo"]);

  // Nothing left in the buffer.
  assert!(parser.parse().unwrap().is_none());
}

#[test]
fn test_pipelined_commands() {
  let mut parser = RespParser::new();
  parser.feed(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
  assert!(parser.parse().unwrap().is_some());
  assert!(parser.parse().unwrap().is_some());
  assert!(parser.parse().unwrap().is_none());
}

#[test]
fn test_inline_command() {
  let result = parse_resp(b"PING\r\n").unwrap();
  let (cmd, args) = extract_command(&result).unwrap();
  assert_eq!(cmd, "PING");
  assert!(args.is_empty());
}

#[test]
fn test_incomplete_is_not_an_error() {
  assert!(matches!(parse_resp(b"$5\r\nhel"), Err(RespError::Incomplete)));
}
