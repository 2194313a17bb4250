//! Integration tests against a mock sibling-server speaking Binary Protocol
//! B, driven through the public `Client` facade.

use std::collections::HashMap;

use kt::{Client, ClientConfig, ServerKind, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAGIC: u8 = 0xC8;
const OP_PUT: u8 = 0x10;
const OP_PUTKEEP: u8 = 0x11;
const OP_OUT: u8 = 0x20;
const OP_GET: u8 = 0x30;
const OP_VSIZ: u8 = 0x38;
const OP_ADDINT: u8 = 0x60;
const OP_VANISH: u8 = 0x72;
const OP_COPY: u8 = 0x73;
const OP_RNUM: u8 = 0x80;
const OP_MISC: u8 = 0x90;

async fn read_u8(stream: &mut TcpStream) -> u8 {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();
    buf[0]
}

async fn read_u32(stream: &mut TcpStream) -> u32 {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    u32::from_be_bytes(buf)
}

async fn read_i32(stream: &mut TcpStream) -> i32 {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    i32::from_be_bytes(buf)
}

async fn read_blob(stream: &mut TcpStream) -> Vec<u8> {
    let len = read_u32(stream).await as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

async fn write_blob(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_u32(bytes.len() as u32).await.unwrap();
    stream.write_all(bytes).await.unwrap();
}

async fn serve_one(mut stream: TcpStream, store: std::sync::Arc<std::sync::Mutex<HashMap<Vec<u8>, Vec<u8>>>>) {
    loop {
        let magic = {
            let mut buf = [0u8; 1];
            match stream.read_exact(&mut buf).await {
                Ok(_) => buf[0],
                Err(_) => return,
            }
        };
        assert_eq!(magic, MAGIC);
        let op = read_u8(&mut stream).await;
        match op {
            OP_PUT => {
                let key = read_blob(&mut stream).await;
                let value = read_blob(&mut stream).await;
                store.lock().unwrap().insert(key, value);
                stream.write_u8(0).await.unwrap();
            }
            OP_PUTKEEP => {
                let key = read_blob(&mut stream).await;
                let value = read_blob(&mut stream).await;
                let existed = {
                    let mut guard = store.lock().unwrap();
                    match guard.entry(key) {
                        std::collections::hash_map::Entry::Occupied(_) => true,
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(value);
                            false
                        }
                    }
                };
                stream.write_u8(if existed { 1 } else { 0 }).await.unwrap();
            }
            OP_OUT => {
                let key = read_blob(&mut stream).await;
                let existed = store.lock().unwrap().remove(&key).is_some();
                stream.write_u8(if existed { 0 } else { 1 }).await.unwrap();
            }
            OP_GET => {
                let key = read_blob(&mut stream).await;
                let found = store.lock().unwrap().get(&key).cloned();
                match found {
                    Some(value) => {
                        stream.write_u8(0).await.unwrap();
                        write_blob(&mut stream, &value).await;
                    }
                    None => stream.write_u8(1).await.unwrap(),
                }
            }
            OP_VSIZ => {
                let key = read_blob(&mut stream).await;
                let size = store.lock().unwrap().get(&key).map(|v| v.len());
                match size {
                    Some(len) => {
                        stream.write_u8(0).await.unwrap();
                        stream.write_i32(len as i32).await.unwrap();
                    }
                    None => stream.write_u8(1).await.unwrap(),
                }
            }
            OP_ADDINT => {
                let key = read_blob(&mut stream).await;
                let delta = read_i32(&mut stream).await;
                let updated = {
                    let mut guard = store.lock().unwrap();
                    let current: i32 = guard
                        .get(&key)
                        .and_then(|v| std::str::from_utf8(v).ok())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let updated = current + delta;
                    guard.insert(key, updated.to_string().into_bytes());
                    updated
                };
                stream.write_u8(0).await.unwrap();
                stream.write_i32(updated).await.unwrap();
            }
            OP_VANISH => {
                store.lock().unwrap().clear();
                stream.write_u8(0).await.unwrap();
            }
            OP_RNUM => {
                let n = store.lock().unwrap().len() as u64;
                stream.write_u64(n).await.unwrap();
            }
            OP_COPY => {
                let _dest = read_blob(&mut stream).await;
                stream.write_u8(0).await.unwrap();
            }
            OP_MISC => {
                let name_len = read_u32(&mut stream).await as usize;
                let _opts = read_u32(&mut stream).await;
                let n_args = read_u32(&mut stream).await as usize;
                let mut name_buf = vec![0u8; name_len];
                stream.read_exact(&mut name_buf).await.unwrap();
                let name = String::from_utf8(name_buf).unwrap();
                let mut args = Vec::with_capacity(n_args);
                for _ in 0..n_args {
                    args.push(read_blob(&mut stream).await);
                }
                match name.as_str() {
                    "putlist" => {
                        {
                            let mut guard = store.lock().unwrap();
                            for pair in args.chunks_exact(2) {
                                guard.insert(pair[0].clone(), pair[1].clone());
                            }
                        }
                        stream.write_u32(0).await.unwrap();
                        stream.write_u32(0).await.unwrap();
                    }
                    "outlist" => {
                        {
                            let mut guard = store.lock().unwrap();
                            for key in &args {
                                guard.remove(key);
                            }
                        }
                        stream.write_u32(0).await.unwrap();
                        stream.write_u32(0).await.unwrap();
                    }
                    "getlist" => {
                        let items = {
                            let guard = store.lock().unwrap();
                            let mut items = Vec::new();
                            for key in &args {
                                if let Some(value) = guard.get(key) {
                                    items.push(key.clone());
                                    items.push(value.clone());
                                }
                            }
                            items
                        };
                        stream.write_u32(0).await.unwrap();
                        stream.write_u32(items.len() as u32).await.unwrap();
                        for item in &items {
                            write_blob(&mut stream, item).await;
                        }
                    }
                    "optindex" => {
                        stream.write_u32(0).await.unwrap();
                        stream.write_u32(0).await.unwrap();
                    }
                    other => panic!("mock sibling server got unexpected misc command {other}"),
                }
            }
            other => panic!("mock sibling server got unexpected opcode {other:#04x}"),
        }
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
        kind: ServerKind::SiblingServer,
        ..Client::builder()
    }
    .build()
    .unwrap()
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.tt_put(b"huey", Value::Text("cat".into())).await.unwrap();
    assert_eq!(client.tt_get(b"huey").await.unwrap(), Some(Value::Text("cat".into())));
}

#[tokio::test]
async fn add_fails_if_key_already_exists() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert!(client.tt_add(b"huey", Value::Text("cat".into())).await.unwrap());
    assert!(!client.tt_add(b"huey", Value::Text("dog".into())).await.unwrap());
}

#[tokio::test]
async fn out_reports_whether_key_existed() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.tt_put(b"huey", Value::Text("cat".into())).await.unwrap();
    assert!(client.tt_out(b"huey").await.unwrap());
    assert!(!client.tt_out(b"huey").await.unwrap());
}

#[tokio::test]
async fn exists_reflects_vsiz_presence() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert!(!client.tt_exists(b"huey").await.unwrap());
    client.tt_put(b"huey", Value::Text("cat".into())).await.unwrap();
    assert!(client.tt_exists(b"huey").await.unwrap());
}

#[tokio::test]
async fn incr_accumulates_across_calls() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert_eq!(client.tt_incr(b"counter", 3).await.unwrap(), 3);
    assert_eq!(client.tt_incr(b"counter", 4).await.unwrap(), 7);
}

#[tokio::test]
async fn clear_and_len_reflect_store_state() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.tt_put(b"a", Value::Text("1".into())).await.unwrap();
    client.tt_put(b"b", Value::Text("2".into())).await.unwrap();
    assert_eq!(client.tt_len().await.unwrap(), 2);

    client.tt_clear().await.unwrap();
    assert_eq!(client.tt_len().await.unwrap(), 0);
}

#[tokio::test]
async fn put_list_and_get_list_round_trip() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client
        .tt_put_list(&[
            (b"a".to_vec(), Value::Text("1".into())),
            (b"b".to_vec(), Value::Text("2".into())),
        ])
        .await
        .unwrap();

    let mut got = client.tt_get_list(&[b"a".to_vec(), b"b".to_vec()]).await.unwrap();
    got.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        got,
        vec![
            (b"a".to_vec(), Value::Text("1".into())),
            (b"b".to_vec(), Value::Text("2".into())),
        ]
    );
}

#[tokio::test]
async fn out_list_removes_every_key() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.tt_put(b"a", Value::Text("1".into())).await.unwrap();
    client.tt_put(b"b", Value::Text("2".into())).await.unwrap();
    client.tt_out_list(&[b"a".to_vec(), b"b".to_vec()]).await.unwrap();
    assert_eq!(client.tt_len().await.unwrap(), 0);
}

#[tokio::test]
async fn copy_reaches_server_without_error() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    client.tt_copy("/tmp/backup.kct").await.unwrap();
}

#[tokio::test]
async fn optimize_index_reaches_server_without_error() {
    let addr = spawn_mock().await;
    let client = client_for(addr).await;

    assert!(client.tt_optimize_index("name").await.unwrap());
}
