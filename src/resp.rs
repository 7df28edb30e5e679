//! RESP wire protocol: value model, streaming parser and encoder.

use std::io::{self, Write};

/// RESP protocol value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
  /// Simple string (+OK\r\n)
  SimpleString(String),
  /// Error (-ERR message\r\n)
  Error(String),
  /// Integer (:123\r\n)
  Integer(i64),
  /// Bulk string ($5\r\nhello\r\n)
  BulkString(Option<String>),
  /// Array (*2\r\n...)
  Array(Option<Vec<RespValue>>),
}

impl RespValue {
  pub fn ok() -> Self {
    RespValue::SimpleString("OK".to_string())
  }

  pub fn pong() -> Self {
    RespValue::SimpleString("PONG".to_string())
  }

  pub fn queued() -> Self {
    RespValue::SimpleString("QUEUED".to_string())
  }

  pub fn null_bulk() -> Self {
    RespValue::BulkString(None)
  }

  pub fn null_array() -> Self {
    RespValue::Array(None)
  }

  pub fn error(msg: &str) -> Self {
    RespValue::Error(msg.to_string())
  }

  pub fn bulk(s: &str) -> Self {
    RespValue::BulkString(Some(s.to_string()))
  }

  pub fn integer(i: i64) -> Self {
    RespValue::Integer(i)
  }

  pub fn array(items: Vec<RespValue>) -> Self {
    RespValue::Array(Some(items))
  }

  /// Encode to RESP wire format
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = Vec::new();
    self.write_to(&mut buf).expect("write to Vec cannot fail");
    buf
  }

  fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
    match self {
      RespValue::SimpleString(s) => {
        write!(w, "+{}\r\n", s)?;
      }
      RespValue::Error(e) => {
        write!(w, "-{}\r\n", e)?;
      }
      RespValue::Integer(i) => {
        write!(w, ":{}\r\n", i)?;
      }
      RespValue::BulkString(None) => {
        write!(w, "$-1\r\n")?;
      }
      RespValue::BulkString(Some(s)) => {
        write!(w, "${}\r\n{}\r\n", s.len(), s)?;
      }
      RespValue::Array(None) => {
        write!(w, "*-1\r\n")?;
      }
      RespValue::Array(Some(items)) => {
        write!(w, "*{}\r\n", items.len())?;
        for item in items {
          item.write_to(w)?;
        }
      }
    }
    Ok(())
  }

  /// Extract string value
  pub fn as_str(&self) -> Option<&str> {
    match self {
      RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => Some(s),
      _ => None,
    }
  }

  /// Extract integer value
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      RespValue::Integer(i) => Some(*i),
      RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => s.parse().ok(),
      _ => None,
    }
  }

  /// Extract array elements
  pub fn as_array(&self) -> Option<&[RespValue]> {
    match self {
      RespValue::Array(Some(arr)) => Some(arr),
      _ => None,
    }
  }
}

/// Translate a reply from the upstream cluster into a RESP value.
impl From<redis::Value> for RespValue {
  fn from(value: redis::Value) -> Self {
    match value {
      redis::Value::Nil => RespValue::BulkString(None),
      redis::Value::Int(i) => RespValue::Integer(i),
      redis::Value::BulkString(bytes) => {
        RespValue::BulkString(Some(String::from_utf8_lossy(&bytes).to_string()))
      }
      redis::Value::SimpleString(s) => RespValue::SimpleString(s),
      redis::Value::Okay => RespValue::ok(),
      redis::Value::Array(items) => {
        RespValue::Array(Some(items.into_iter().map(RespValue::from).collect()))
      }
      redis::Value::Double(d) => RespValue::BulkString(Some(d.to_string())),
      redis::Value::Boolean(b) => RespValue::Integer(i64::from(b)),
      redis::Value::Map(pairs) => {
        let mut items = Vec::with_capacity(pairs.len() * 2);
        for (k, v) in pairs {
          items.push(RespValue::from(k));
          items.push(RespValue::from(v));
        }
        RespValue::Array(Some(items))
      }
      redis::Value::Set(items) => {
        RespValue::Array(Some(items.into_iter().map(RespValue::from).collect()))
      }
      other => RespValue::Error(format!("ERR unsupported reply type {:?}", other)),
    }
  }
}

/// RESP parse error
#[derive(Debug, Clone)]
pub enum RespError {
  /// Incomplete data, need more bytes
  Incomplete,
  /// Invalid protocol format
  Invalid(String),
}

impl std::fmt::Display for RespError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RespError::Incomplete => write!(f, "incomplete data"),
      RespError::Invalid(msg) => write!(f, "invalid RESP: {}", msg),
    }
  }
}

impl std::error::Error for RespError {}

/// Streaming RESP parser; feed bytes, pull complete values.
pub struct RespParser {
  buffer: Vec<u8>,
  pos: usize,
}

impl Default for RespParser {
  fn default() -> Self {
    Self::new()
  }
}

impl RespParser {
  pub fn new() -> Self {
    Self {
      buffer: Vec::new(),
      pos: 0,
    }
  }

  /// Add data to the parse buffer
  pub fn feed(&mut self, data: &[u8]) {
    self.buffer.extend_from_slice(data);
  }

  /// Try to parse the next value from the buffer
  pub fn parse(&mut self) -> Result<Option<RespValue>, RespError> {
    if self.pos >= self.buffer.len() {
      return Ok(None);
    }

    let start_pos = self.pos;
    match self.parse_value() {
      Ok(value) => {
        self.buffer.drain(..self.pos);
        self.pos = 0;
        Ok(Some(value))
      }
      Err(RespError::Incomplete) => {
        // Wait for more data
        self.pos = start_pos;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  fn parse_value(&mut self) -> Result<RespValue, RespError> {
    let byte = self.read_byte()?;

    match byte {
      b'+' => Ok(RespValue::SimpleString(self.read_line()?)),
      b'-' => Ok(RespValue::Error(self.read_line()?)),
      b':' => {
        let line = self.read_line()?;
        let i = line
          .parse()
          .map_err(|_| RespError::Invalid(format!("invalid integer: {}", line)))?;
        Ok(RespValue::Integer(i))
      }
      b'$' => self.parse_bulk_string(),
      b'*' => self.parse_array(),
      _ => {
        // Inline command (no prefix)
        self.pos -= 1;
        self.parse_inline_command()
      }
    }
  }

  fn parse_bulk_string(&mut self) -> Result<RespValue, RespError> {
    let len_str = self.read_line()?;
    let len: i64 = len_str
      .parse()
      .map_err(|_| RespError::Invalid(format!("invalid bulk string length: {}", len_str)))?;

    if len < 0 {
      return Ok(RespValue::BulkString(None));
    }

    let len = len as usize;
    if self.pos + len + 2 > self.buffer.len() {
      return Err(RespError::Incomplete);
    }

    let data = &self.buffer[self.pos..self.pos + len];
    let s = String::from_utf8_lossy(data).to_string();
    self.pos += len;

    if &self.buffer[self.pos..self.pos + 2] != b"\r\n" {
      return Err(RespError::Invalid("missing CRLF after bulk string".to_string()));
    }
    self.pos += 2;

    Ok(RespValue::BulkString(Some(s)))
  }

  fn parse_array(&mut self) -> Result<RespValue, RespError> {
    let len_str = self.read_line()?;
    let len: i64 = len_str
      .parse()
      .map_err(|_| RespError::Invalid(format!("invalid array length: {}", len_str)))?;

    if len < 0 {
      return Ok(RespValue::Array(None));
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len);

    for _ in 0..len {
      items.push(self.parse_value()?);
    }

    Ok(RespValue::Array(Some(items)))
  }

  fn parse_inline_command(&mut self) -> Result<RespValue, RespError> {
    let line = self.read_line()?;
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.is_empty() {
      return Err(RespError::Invalid("empty command".to_string()));
    }

    let items: Vec<RespValue> = parts
      .into_iter()
      .map(|s| RespValue::BulkString(Some(s.to_string())))
      .collect();

    Ok(RespValue::Array(Some(items)))
  }

  fn read_byte(&mut self) -> Result<u8, RespError> {
    if self.pos >= self.buffer.len() {
      return Err(RespError::Incomplete);
    }
    let byte = self.buffer[self.pos];
    self.pos += 1;
    Ok(byte)
  }

  fn read_line(&mut self) -> Result<String, RespError> {
    let start = self.pos;

    loop {
      if self.pos + 1 >= self.buffer.len() {
        return Err(RespError::Incomplete);
      }

      if self.buffer[self.pos] == b'\r' && self.buffer[self.pos + 1] == b'\n' {
        let line = &self.buffer[start..self.pos];
        let s = String::from_utf8_lossy(line).to_string();
        self.pos += 2;
        return Ok(s);
      }

      self.pos += 1;
    }
  }
}

/// Parse a single RESP value from bytes
pub fn parse_resp(data: &[u8]) -> Result<RespValue, RespError> {
  let mut parser = RespParser::new();
  parser.feed(data);
  parser.parse()?.ok_or(RespError::Incomplete)
}

/// Extract command name and arguments from a RESP array
pub fn extract_command(value: &RespValue) -> Option<(String, Vec<String>)> {
  let arr = value.as_array()?;
  if arr.is_empty() {
    return None;
  }

  let cmd = arr[0].as_str()?.to_uppercase();
  let args: Vec<String> = arr[1..]
    .iter()
    .filter_map(|v| v.as_str().map(String::from))
    .collect();

  Some((cmd, args))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_simple_string() {
    let result = parse_resp(b"+OK\r\n").unwrap();
    assert_eq!(result, RespValue::SimpleString("OK".to_string()));
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
  fn test_parse_array() {
    let result = parse_resp(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
    assert_eq!(
      result,
      RespValue::Array(Some(vec![
        RespValue::BulkString(Some("GET".to_string())),
        RespValue::BulkString(Some("foo".to_string())),
      ]))
    );
  }

  #[test]
  fn test_from_redis_value() {
    assert_eq!(RespValue::from(redis::Value::Nil), RespValue::null_bulk());
    assert_eq!(RespValue::from(redis::Value::Int(7)), RespValue::integer(7));
    assert_eq!(
      RespValue::from(redis::Value::BulkString(b"alice".to_vec())),
      RespValue::bulk("alice")
    );
    assert_eq!(RespValue::from(redis::Value::Okay), RespValue::ok());
    assert_eq!(
      RespValue::from(redis::Value::Array(vec![redis::Value::Nil, redis::Value::Int(1)])),
      RespValue::array(vec![RespValue::null_bulk(), RespValue::integer(1)])
    );
  }

  #[test]
  fn test_inline_command() {
    let result = parse_resp(b"PING\r\n").unwrap();
    let (cmd, args) = extract_command(&result).unwrap();
    assert_eq!(cmd, "PING");
    assert!(args.is_empty());
  }
}
