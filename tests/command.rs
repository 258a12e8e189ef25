use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::Command;
use std::thread;

const NAME: &str = "reuse";

/// Answers every request on a connection with an empty 200 until the client
/// hangs up.
fn serve(mut socket: TcpStream) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        while let Some(pos) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            pending.drain(..pos + 4);
            if socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .is_err()
            {
                return;
            }
        }
        match socket.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for socket in listener.incoming().flatten() {
            thread::spawn(move || serve(socket));
        }
    });
    addr
}

#[test]
fn test_command_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("reuse version"));
    Ok(())
}

#[test]
fn test_command_rejects_bad_header() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("-H").arg("no-colon").arg("http://127.0.0.1/");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("expected 2 strings separated by a :"));
    Ok(())
}

#[test]
fn test_command_connection_refused() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("-r")
        .arg("1")
        .arg("--noproxy")
        .arg(format!("http://{}/", addr));
    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("no completed probes"))
        .stderr(predicate::str::contains("Repetition 1 of 1 failed"));
    Ok(())
}

#[test]
fn test_command_probe_run() -> Result<(), Box<dyn std::error::Error>> {
    let addr = start_server();
    let mut cmd = Command::cargo_bin(NAME)?;
    cmd.arg("-r")
        .arg("3")
        .arg("-w")
        .arg("0s")
        .arg("--noproxy")
        .arg(format!("http://{}/", addr));
    let output = cmd.output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("lport Remote Address"));
    let remote = addr.to_string();
    assert!(lines[1].contains(&remote));
    assert!(lines[1].contains(" 200 000 "));
    assert!(lines[2].contains(" 200 010 "));
    assert!(lines[3].contains(" 200 010 "));
    assert_eq!("--- Summary Statistics ---", lines[4]);
    assert!(stdout.contains("Total    "));
    assert!(!stdout.contains("no completed probes"));
    Ok(())
}
