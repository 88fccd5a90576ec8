//! Minimal ICAP wire-level exercise client.
//!
//! Sends OPTIONS, a REQMOD with an empty (null) body, and a RESPMOD
//! with a small chunked body straight over TCP, against a server
//! started with `cargo run --example simple_server`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("icap-core wire-level test client");
    println!("=================================");

    test_options_request()?;
    test_reqmod_request()?;
    test_respmod_request()?;

    Ok(())
}

fn read_response(stream: &mut TcpStream) -> std::io::Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}

fn test_options_request() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n1. Testing OPTIONS request...");

    let mut stream = TcpStream::connect("127.0.0.1:1344")?;
    let request = "OPTIONS icap://127.0.0.1:1344/echo ICAP/1.0\r\nHost: 127.0.0.1:1344\r\nUser-Agent: icap-core-test-client\r\nConnection: close\r\n\r\n";
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    println!("Response:\n{}", read_response(&mut stream)?);
    Ok(())
}

fn test_reqmod_request() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n2. Testing REQMOD request with a null body...");

    let mut stream = TcpStream::connect("127.0.0.1:1344")?;
    let http_req = "GET /test HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Test-Browser\r\n\r\n";
    let request = format!(
        "REQMOD icap://127.0.0.1:1344/echo ICAP/1.0\r\nHost: 127.0.0.1:1344\r\nUser-Agent: icap-core-test-client\r\nConnection: close\r\nAllow: 204\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n{http_req}",
        http_req.len(),
    );

    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    println!("Response:\n{}", read_response(&mut stream)?);
    Ok(())
}

fn test_respmod_request() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n3. Testing RESPMOD request with a small chunked body...");

    let mut stream = TcpStream::connect("127.0.0.1:1344")?;
    let http_req = "GET /test HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let http_res_hdr = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";
    let body = b"<html><body>Test content</body></html>";

    let mut chunked_body = Vec::new();
    chunked_body.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
    chunked_body.extend_from_slice(body);
    chunked_body.extend_from_slice(b"\r\n0\r\n\r\n");

    let req_hdr_off = 0;
    let res_hdr_off = http_req.len();
    let res_body_off = res_hdr_off + http_res_hdr.len();
    let request_head = format!(
        "RESPMOD icap://127.0.0.1:1344/echo ICAP/1.0\r\nHost: 127.0.0.1:1344\r\nUser-Agent: icap-core-test-client\r\nConnection: close\r\nEncapsulated: req-hdr={req_hdr_off}, res-hdr={res_hdr_off}, res-body={res_body_off}\r\n\r\n{http_req}{http_res_hdr}",
    );

    let mut wire = request_head.into_bytes();
    wire.extend_from_slice(&chunked_body);

    stream.write_all(&wire)?;
    stream.flush()?;

    println!("Response:\n{}", read_response(&mut stream)?);
    Ok(())
}
