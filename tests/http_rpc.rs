//! Integration tests against a mock HTTP/TSV RPC server (§4.7), driven
//! through the public `Client` facade.

use std::collections::HashMap;

use base64::Engine;
use kt::{Client, ClientConfig, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(text: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD.decode(text).unwrap()
}

async fn read_request(stream: &mut TcpStream) -> (String, HashMap<Vec<u8>, Vec<u8>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap();
    let path = request_line.split_whitespace().nth(1).unwrap().to_string();
    let content_length: usize = lines
        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .unwrap_or_default()
        .parse()
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        body.extend_from_slice(&chunk[..n]);
    }

    let mut fields = HashMap::new();
    for line in body.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, |&b| b == b'\t');
        let key = std::str::from_utf8(parts.next().unwrap()).unwrap();
        let value = std::str::from_utf8(parts.next().unwrap_or(b"")).unwrap();
        fields.insert(unb64(key), unb64(value));
    }
    (path, fields)
}

async fn write_response(stream: &mut TcpStream, status: u16, fields: &[(Vec<u8>, Vec<u8>)]) {
    let reason = match status {
        200 => "OK",
        450 => "Logical Inconsistency",
        _ => "Error",
    };
    let mut body = Vec::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            body.push(b'\n');
        }
        body.extend_from_slice(b64(key).as_bytes());
        body.push(b'\t');
        body.extend_from_slice(b64(value).as_bytes());
    }
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/tab-separated-values; colenc=B\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn serve_one(mut stream: TcpStream, store: std::sync::Arc<std::sync::Mutex<HashMap<Vec<u8>, Vec<u8>>>>) {
    let (path, fields) = read_request(&mut stream).await;
    let cmd = path.trim_start_matches("/rpc/");
    match cmd {
        "add" => {
            let key = fields.get(b"key".as_slice()).cloned().unwrap_or_default();
            let value = fields.get(b"value".as_slice()).cloned().unwrap_or_default();
            let already_present = {
                let mut guard = store.lock().unwrap();
                let present = guard.contains_key(&key);
                if !present {
                    guard.insert(key, value);
                }
                present
            };
            if already_present {
                write_response(&mut stream, 450, &[]).await;
            } else {
                write_response(&mut stream, 200, &[]).await;
            }
        }
        "get" => {
            let key = fields.get(b"key".as_slice()).cloned().unwrap_or_default();
            let found = store.lock().unwrap().get(&key).cloned();
            match found {
                Some(value) => write_response(&mut stream, 200, &[(b"value".to_vec(), value)]).await,
                None => write_response(&mut stream, 450, &[]).await,
            }
        }
        "cas" => {
            let key = fields.get(b"key".as_slice()).cloned().unwrap_or_default();
            let oval = fields.get(b"oval".as_slice()).cloned();
            let nval = fields.get(b"nval".as_slice()).cloned();
            let matches = {
                let mut guard = store.lock().unwrap();
                let matches = match &oval {
                    Some(oval) => guard.get(&key) == Some(oval),
                    None => !guard.contains_key(&key),
                };
                if matches {
                    match &nval {
                        Some(nval) => {
                            guard.insert(key.clone(), nval.clone());
                        }
                        None => {
                            guard.remove(&key);
                        }
                    }
                }
                matches
            };
            if !matches {
                write_response(&mut stream, 450, &[]).await;
                return;
            }
            write_response(&mut stream, 200, &[]).await;
        }
        "match_prefix" => {
            let prefix = fields.get(b"prefix".as_slice()).cloned().unwrap_or_default();
            let mut matched: Vec<_> = {
                let guard = store.lock().unwrap();
                guard.keys().filter(|k| k.starts_with(&prefix)).cloned().collect()
            };
            matched.sort();
            let response_fields: Vec<_> = matched
                .into_iter()
                .enumerate()
                .map(|(i, k)| (k, i.to_string().into_bytes()))
                .collect();
            write_response(&mut stream, 200, &response_fields).await;
        }
        "status" => {
            let count = store.lock().unwrap().len();
            write_response(
                &mut stream,
                200,
                &[
                    (b"count".to_vec(), count.to_string().into_bytes()),
                    (b"size".to_vec(), b"0".to_vec()),
                ],
            )
            .await;
        }
        other => panic!("mock http server got unexpected path {other}"),
    }
}

async fn spawn_mock() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = std::sync::Arc::new(std::sync::Mutex::new(HashMap::new()));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_one(stream, store.clone()));
        }
    });
    addr
}

async fn client_for(addr: std::net::SocketAddr) -> Client {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..Client::builder()
    }
    .build()
    .unwrap()
}

#[tokio::test]
async fn add_then_get_round_trips() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert!(client.add(b"huey", Value::Text("cat".into()), None, None).await.unwrap());
    assert_eq!(client.http_get(b"huey", None).await.unwrap(), Some(Value::Text("cat".into())));
}

#[tokio::test]
async fn add_fails_when_key_already_present() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert!(client.add(b"huey", Value::Text("cat".into()), None, None).await.unwrap());
    assert!(!client.add(b"huey", Value::Text("dog".into()), None, None).await.unwrap());
}

#[tokio::test]
async fn cas_requires_matching_old_value() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.add(b"huey", Value::Text("cat".into()), None, None).await.unwrap();
    let ok = client
        .cas(b"huey", Some(Value::Text("wrong".into())), Some(Value::Text("dog".into())), None, None)
        .await
        .unwrap();
    assert!(!ok);

    let ok = client
        .cas(b"huey", Some(Value::Text("cat".into())), Some(Value::Text("dog".into())), None, None)
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(client.http_get(b"huey", None).await.unwrap(), Some(Value::Text("dog".into())));
}

#[tokio::test]
async fn match_prefix_returns_matching_keys_sorted_by_rank() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.add(b"cat_huey", Value::Text("1".into()), None, None).await.unwrap();
    client.add(b"cat_mickey", Value::Text("2".into()), None, None).await.unwrap();
    client.add(b"dog_buddy", Value::Text("3".into()), None, None).await.unwrap();

    let matched = client.match_prefix(b"cat_", None, None).await.unwrap();
    assert_eq!(matched, vec![b"cat_huey".to_vec(), b"cat_mickey".to_vec()]);
}

#[tokio::test]
async fn db_field_is_sent_before_record_fields() {
    // §8 test vector 3: a `set` of ("key","val") under DB=0 puts the `DB`
    // control line first on the wire, ahead of the record itself.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, ordered_body) = read_raw_request(&mut stream).await;
        write_response(&mut stream, 200, &[]).await;
        ordered_body
    });

    let client = client_for(addr).await;
    client.add(b"key", Value::Text("val".into()), Some(0), None).await.unwrap();

    let body = server.await.unwrap();
    let first_line = body.lines().next().unwrap();
    let first_key = first_line.split('\t').next().unwrap();
    assert_eq!(unb64(first_key), b"DB");
}

async fn read_raw_request(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .unwrap_or_default()
        .parse()
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        body.extend_from_slice(&chunk[..n]);
    }
    (head, String::from_utf8(body).unwrap())
}

#[tokio::test]
async fn len_reflects_status_count_field() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.add(b"huey", Value::Text("cat".into()), None, None).await.unwrap();
    client.add(b"mickey", Value::Text("cat".into()), None, None).await.unwrap();
    assert_eq!(client.len(None).await.unwrap(), 2);
}
