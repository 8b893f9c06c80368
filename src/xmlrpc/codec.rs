use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDateTime;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::CodecError;
use super::value::{DATETIME_FORMAT, Value};
use crate::error::Fault;

/// Decoded `methodResponse`: either the single result value or a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(Value),
    Fault(Fault),
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(CodecError::new)?;
    start(&mut writer, "methodCall")?;
    text_element(&mut writer, "methodName", method)?;
    start(&mut writer, "params")?;
    for param in params {
        start(&mut writer, "param")?;
        write_value(&mut writer, param)?;
        end(&mut writer, "param")?;
    }
    end(&mut writer, "params")?;
    end(&mut writer, "methodCall")?;
    Ok(writer.into_inner())
}

/// Decode a `methodResponse` document.
pub fn decode_response(body: &[u8]) -> Result<MethodResponse, CodecError> {
    let root = parse_tree(body)?;
    if root.name != "methodResponse" {
        return Err(CodecError(format!(
            "expected methodResponse, found <{}>",
            root.name
        )));
    }

    if let Some(fault) = root.child("fault") {
        let value = parse_value(fault.required("value")?)?;
        return Ok(MethodResponse::Fault(fault_from_value(&value)?));
    }

    let value = root
        .required("params")?
        .required("param")?
        .required("value")?;
    Ok(MethodResponse::Success(parse_value(value)?))
}

fn fault_from_value(value: &Value) -> Result<Fault, CodecError> {
    let code = match value.get("faultCode") {
        Some(Value::Int(code)) => code.to_string(),
        Some(Value::String(code)) => code.clone(),
        _ => return Err(CodecError("fault without faultCode".to_string())),
    };
    let message = value
        .get("faultString")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError("fault without faultString".to_string()))?
        .to_string();
    Ok(Fault { code, message })
}

fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<(), CodecError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(CodecError::new)
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<(), CodecError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(CodecError::new)
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), CodecError> {
    start(writer, name)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(CodecError::new)?;
    end(writer, name)
}

fn write_value(writer: &mut Writer<Vec<u8>>, value: &Value) -> Result<(), CodecError> {
    start(writer, "value")?;
    match value {
        Value::Int(i) => {
            // <int> is 32-bit on most servers
            let tag = if i32::try_from(*i).is_ok() { "int" } else { "i8" };
            text_element(writer, tag, &i.to_string())?;
        }
        Value::Bool(b) => text_element(writer, "boolean", if *b { "1" } else { "0" })?,
        Value::Double(d) => {
            if !d.is_finite() {
                return Err(CodecError(format!("cannot encode non-finite double {d}")));
            }
            text_element(writer, "double", &d.to_string())?;
        }
        Value::String(s) => text_element(writer, "string", s)?,
        Value::DateTime(dt) => text_element(
            writer,
            "dateTime.iso8601",
            &dt.format(DATETIME_FORMAT).to_string(),
        )?,
        Value::Base64(bytes) => text_element(writer, "base64", &STANDARD.encode(bytes))?,
        Value::Array(items) => {
            start(writer, "array")?;
            start(writer, "data")?;
            for item in items {
                write_value(writer, item)?;
            }
            end(writer, "data")?;
            end(writer, "array")?;
        }
        Value::Struct(members) => {
            start(writer, "struct")?;
            for (name, member) in members {
                start(writer, "member")?;
                text_element(writer, "name", name)?;
                write_value(writer, member)?;
                end(writer, "member")?;
            }
            end(writer, "struct")?;
        }
        Value::Nil => writer
            .write_event(Event::Empty(BytesStart::new("nil")))
            .map(|_| ())
            .map_err(CodecError::new)?,
    }
    end(writer, "value")
}

/// Minimal element tree; XML-RPC documents are small and strictly nested.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn named(name: &[u8]) -> Self {
        Node {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn required(&self, name: &str) -> Result<&Node, CodecError> {
        self.child(name)
            .ok_or_else(|| CodecError(format!("<{}> without <{}>", self.name, name)))
    }
}

fn parse_tree(body: &[u8]) -> Result<Node, CodecError> {
    let xml = std::str::from_utf8(body).map_err(CodecError::new)?;
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event().map_err(CodecError::new)? {
            Event::Start(e) => stack.push(Node::named(e.local_name().as_ref())),
            Event::Empty(e) => attach(&mut stack, &mut root, Node::named(e.local_name().as_ref()))?,
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| CodecError("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape().map_err(CodecError::new)?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(CodecError(format!("unclosed <{}>", open.name)));
    }
    root.ok_or_else(|| CodecError("empty document".to_string()))
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) -> Result<(), CodecError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(CodecError("multiple root elements".to_string())),
    }
    Ok(())
}

fn parse_value(node: &Node) -> Result<Value, CodecError> {
    // An untyped <value>text</value> is a string
    let Some(typed) = node.children.first() else {
        return Ok(Value::String(node.text.clone()));
    };

    let text = typed.text.trim();
    let value = match typed.name.as_str() {
        "int" | "i4" | "i8" => Value::Int(
            text.parse()
                .map_err(|e| CodecError(format!("bad <{}> {:?}: {e}", typed.name, text)))?,
        ),
        "boolean" => match text {
            "1" | "true" => Value::Bool(true),
            "0" | "false" => Value::Bool(false),
            other => return Err(CodecError(format!("bad <boolean> {other:?}"))),
        },
        "double" => Value::Double(
            text.parse()
                .map_err(|e| CodecError(format!("bad <double> {text:?}: {e}")))?,
        ),
        "string" => Value::String(typed.text.clone()),
        "dateTime.iso8601" => Value::DateTime(
            NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
                .map_err(|e| CodecError(format!("bad <dateTime.iso8601> {text:?}: {e}")))?,
        ),
        "base64" => {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            Value::Base64(STANDARD.decode(compact).map_err(CodecError::new)?)
        }
        "array" => {
            let data = typed.required("data")?;
            Value::Array(
                data.children_named("value")
                    .map(parse_value)
                    .collect::<Result<Vec<_>, CodecError>>()?,
            )
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in typed.children_named("member") {
                let name = member.required("name")?.text.clone();
                members.insert(name, parse_value(member.required("value")?)?);
            }
            Value::Struct(members)
        }
        "nil" => Value::Nil,
        other => return Err(CodecError(format!("unknown value type <{other}>"))),
    };
    Ok(value)
}

/// Decode a `methodCall` into its method name and params.
#[cfg(test)]
pub fn decode_call(body: &[u8]) -> Result<(String, Vec<Value>), CodecError> {
    let root = parse_tree(body)?;
    let method = root.required("methodName")?.text.trim().to_string();
    let params = match root.child("params") {
        Some(params) => params
            .children_named("param")
            .map(|p| p.required("value").and_then(parse_value))
            .collect::<Result<Vec<_>, CodecError>>()?,
        None => Vec::new(),
    };
    Ok((method, params))
}

/// Encode a successful `methodResponse`.
#[cfg(test)]
pub fn encode_response(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Vec::new());
    start(&mut writer, "methodResponse")?;
    start(&mut writer, "params")?;
    start(&mut writer, "param")?;
    write_value(&mut writer, value)?;
    end(&mut writer, "param")?;
    end(&mut writer, "params")?;
    end(&mut writer, "methodResponse")?;
    Ok(writer.into_inner())
}

/// Encode a fault `methodResponse`.
#[cfg(test)]
pub fn encode_fault(code: i64, message: &str) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Vec::new());
    start(&mut writer, "methodResponse")?;
    start(&mut writer, "fault")?;
    write_value(
        &mut writer,
        &Value::struct_from([
            ("faultCode", Value::Int(code)),
            ("faultString", Value::from(message)),
        ]),
    )?;
    end(&mut writer, "fault")?;
    end(&mut writer, "methodResponse")?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(inner: &str) -> Vec<u8> {
        format!(
            "<?xml version='1.0'?>\n<methodResponse>\n<params>\n<param>\n{inner}\n</param>\n</params>\n</methodResponse>\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_encode_call_layout() {
        let body = encode_call("authenticate", &[Value::from("db"), Value::Int(2)]).unwrap();
        let xml = String::from_utf8(body).unwrap();
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(xml.contains("<methodName>authenticate</methodName>"));
        assert!(xml.contains(
            "<params><param><value><string>db</string></value></param>\
             <param><value><int>2</int></value></param></params>"
        ));
    }

    #[test]
    fn test_encode_escapes_text() {
        let body = encode_call("m", &[Value::from("<b>Tom & Jerry</b>")]).unwrap();
        let xml = String::from_utf8(body).unwrap();
        assert!(xml.contains("&lt;b&gt;Tom &amp; Jerry&lt;/b&gt;"));

        let (_, params) = decode_call(xml.as_bytes()).unwrap();
        assert_eq!(params, vec![Value::from("<b>Tom & Jerry</b>")]);
    }

    #[test]
    fn test_encode_large_int_as_i8() {
        let body = encode_call("m", &[Value::Int(5_000_000_000)]).unwrap();
        let xml = String::from_utf8(body).unwrap();
        assert!(xml.contains("<i8>5000000000</i8>"));
    }

    #[test]
    fn test_encode_rejects_nan() {
        assert!(encode_call("m", &[Value::Double(f64::NAN)]).is_err());
    }

    #[test]
    fn test_decode_int_variants() {
        for tag in ["int", "i4", "i8"] {
            let body = response(&format!("<value><{tag}> 42 </{tag}></value>"));
            assert_eq!(
                decode_response(&body).unwrap(),
                MethodResponse::Success(Value::Int(42))
            );
        }
    }

    #[test]
    fn test_decode_untyped_value_is_string() {
        let body = response("<value>  padded  </value>");
        assert_eq!(
            decode_response(&body).unwrap(),
            MethodResponse::Success(Value::from("  padded  "))
        );
    }

    #[test]
    fn test_decode_string_keeps_whitespace() {
        let body = response("<value><string> a &amp; b </string></value>");
        assert_eq!(
            decode_response(&body).unwrap(),
            MethodResponse::Success(Value::from(" a & b "))
        );
    }

    #[test]
    fn test_decode_empty_string_element() {
        let body = response("<value><string/></value>");
        assert_eq!(
            decode_response(&body).unwrap(),
            MethodResponse::Success(Value::from(""))
        );
    }

    #[test]
    fn test_decode_search_read_result() {
        let body = response(
            r#"<value><array><data>
<value><struct>
<member><name>id</name><value><int>12</int></value></member>
<member><name>channel_id</name><value><array><data>
<value><int>105</int></value><value><string>Support</string></value>
</data></array></value></member>
<member><name>fold_state</name><value><boolean>0</boolean></value></member>
<member><name>last_seen</name><value><dateTime.iso8601>20250217T08:15:00</dateTime.iso8601></value></member>
<member><name>note</name><value><nil/></value></member>
</struct></value>
</data></array></value>"#,
        );

        let MethodResponse::Success(value) = decode_response(&body).unwrap() else {
            panic!("expected success");
        };
        let rows = value.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("id"), Some(&Value::Int(12)));
        assert_eq!(
            row.get("channel_id").and_then(Value::as_many2one),
            Some((105, "Support"))
        );
        assert_eq!(row.get("fold_state"), Some(&Value::Bool(false)));
        assert_eq!(row.get("note"), Some(&Value::Nil));
        assert!(matches!(row.get("last_seen"), Some(Value::DateTime(_))));
    }

    #[test]
    fn test_decode_base64_and_double() {
        let body = response(
            "<value><array><data><value><base64>aGVs\nbG8=</base64></value><value><double>2.5</double></value></data></array></value>",
        );
        assert_eq!(
            decode_response(&body).unwrap(),
            MethodResponse::Success(Value::Array(vec![
                Value::Base64(b"hello".to_vec()),
                Value::Double(2.5)
            ]))
        );
    }

    #[test]
    fn test_decode_fault_keeps_message() {
        let body = br#"<?xml version="1.0"?>
<methodResponse><fault><value><struct>
<member><name>faultCode</name><value><int>1</int></value></member>
<member><name>faultString</name><value><string>Traceback (most recent call last):
  ValueError: Invalid field 'foo' on model 'discuss.channel'</string></value></member>
</struct></value></fault></methodResponse>"#;

        let MethodResponse::Fault(fault) = decode_response(body).unwrap() else {
            panic!("expected fault");
        };
        assert_eq!(fault.code, "1");
        assert_eq!(
            fault.message,
            "Traceback (most recent call last):\n  ValueError: Invalid field 'foo' on model 'discuss.channel'"
        );
    }

    #[test]
    fn test_decode_fault_with_string_code() {
        let body = encode_fault(0, "x").unwrap();
        let xml = String::from_utf8(body)
            .unwrap()
            .replace("<int>0</int>", "<string>warning</string>");
        let MethodResponse::Fault(fault) = decode_response(xml.as_bytes()).unwrap() else {
            panic!("expected fault");
        };
        assert_eq!(fault.code, "warning");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_response(b"").is_err());
        assert!(decode_response(b"<html><body>502 Bad Gateway</body></html>").is_err());
        assert!(decode_response(b"<methodResponse><params>").is_err());
        assert!(decode_response(&response("<value><int>abc</int></value>")).is_err());
        assert!(decode_response(&response("<value><float>1</float></value>")).is_err());
    }

    #[test]
    fn test_response_encoding_is_readable_back() {
        let value = Value::from(json!({"k": "v", "ids": [1, 2], "flag": true}));
        let body = encode_response(&value).unwrap();
        assert_eq!(
            decode_response(&body).unwrap(),
            MethodResponse::Success(value)
        );
    }
}
