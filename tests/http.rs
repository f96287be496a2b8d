use switchyard::http::{HttpParser, HttpReader, ParserType, PropertyBag};

#[test]
fn request_split_mid_header() {
    let mut parser = HttpParser::request();

    let first = b"GET /path HTTP/1.1\r\nHo";
    let second = b"st: x\r\n\r\n";
    assert_eq!(parser.execute(first).unwrap(), first.len());
    assert!(!parser.is_finish());
    assert_eq!(parser.property().path, "/path");
    assert_eq!(parser.execute(second).unwrap(), second.len());
    assert!(parser.is_finish());

    let bag = parser.property();
    assert_eq!(bag.method, "GET");
    assert_eq!(bag.path, "/path");
    assert_eq!(bag.headers.get("Host"), Some("x"));
    assert!(parser.should_keep_alive());
}

#[test]
fn every_split_point_gives_the_same_bag() {
    let message: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
        Content-Type: text/plain\r\n\
        Transfer-Encoding: chunked\r\n\
        \r\n\
        3\r\nabc\r\n\
        2\r\nde\r\n\
        0\r\n\r\n";

    let mut whole = HttpParser::response();
    whole.execute(message).unwrap();
    assert!(whole.is_finish());

    for split in 1..message.len() {
        let mut parser = HttpParser::response();
        let (head, tail) = message.split_at(split);
        assert_eq!(parser.execute(head).unwrap(), head.len());
        assert!(!parser.is_finish(), "finished early at split {split}");
        assert_eq!(parser.execute(tail).unwrap(), tail.len());
        assert!(parser.is_finish(), "not finished at split {split}");
        assert_eq!(parser.property(), whole.property(), "split {split}");
    }
}

#[test]
fn keep_alive_follows_version_and_connection() {
    let mut parser = HttpParser::request();
    parser.execute(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    assert!(!parser.should_keep_alive());

    parser.clear();
    parser
        .execute(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert!(parser.should_keep_alive());

    parser.clear();
    parser
        .execute(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    assert!(!parser.should_keep_alive());
}

#[test]
fn serialized_response_parses_back() {
    let mut bag = PropertyBag::new();
    bag.status = 200;
    bag.append_body(b"<p>hi</p>");
    bag.update_default_response();
    let wire = bag.to_response_bytes();

    let mut reader = HttpReader::new(ParserType::Response);
    let messages = reader.feed(&wire).unwrap();
    assert_eq!(messages.len(), 1);

    let parsed = &messages[0];
    assert_eq!(parsed.status, 200);
    assert_eq!(parsed.reason, "OK");
    assert_eq!(parsed.headers.get("content-length"), Some("9"));
    assert_eq!(parsed.body_text(), "<p>hi</p>");
}

#[test]
fn malformed_input_reports_errno() {
    let mut parser = HttpParser::request();
    let error = parser
        .execute(b"GET / HTTP/1.1\r\nContent-Length: nope\r\n\r\n")
        .unwrap_err();
    assert_eq!(parser.errno_name(), Some(error.name()));
    assert!(error.name().starts_with("HPE_"));
    assert!(!error.description().is_empty());
}
