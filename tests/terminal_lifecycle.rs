//! End-to-end PTY scenarios seeded directly from the concrete examples in
//! the terminal execution service's testable-properties list: cold start,
//! command echo, signal delivery to a foreground child, and a binary
//! stdin/stdout round trip.

use std::time::Duration;

use action_engine::terminal::{parse_signal, Terminal};

fn read_until<F: Fn(&str, bool) -> bool>(term: &Terminal, attempts: usize, done: F) -> String {
    let mut combined = Vec::new();
    for _ in 0..attempts {
        let out = term.read_blocking();
        if let Some(bytes) = &out.output {
            combined.extend_from_slice(bytes);
        }
        let text = String::from_utf8_lossy(&combined).into_owned();
        if done(&text, out.is_done) {
            break;
        }
    }
    String::from_utf8_lossy(&combined).into_owned()
}

#[test]
fn shell_cold_start_reaches_prompt() {
    let term = Terminal::start().expect("terminal should spawn");
    let text = read_until(&term, 50, |text, is_done| is_done || text.ends_with("cmd> "));
    assert!(text.ends_with("cmd> ") || text.contains("cmd> "));
    term.close();
}

#[test]
fn command_echo_round_trips_and_returns_to_prompt() {
    let term = Terminal::start().expect("terminal should spawn");
    let _ = read_until(&term, 50, |_, is_done| is_done);

    term.send_text("echo hi\n").expect("send should succeed");
    let mut done_count = 0;
    let mut combined = Vec::new();
    for _ in 0..100 {
        let out = term.read_blocking();
        if let Some(bytes) = out.output {
            combined.extend_from_slice(&bytes);
        }
        if out.is_done {
            done_count += 1;
            break;
        }
    }
    let text = String::from_utf8_lossy(&combined);
    assert!(text.contains("echo hi\r\nhi\r\n"), "got {text:?}");
    assert_eq!(done_count, 1);
    term.close();
}

#[test]
fn signal_to_foreground_child_returns_shell_to_prompt() {
    let term = Terminal::start().expect("terminal should spawn");
    let _ = read_until(&term, 50, |_, is_done| is_done);

    term.send_text("sleep 60\n").expect("send should succeed");

    // Give the child a moment to become the foreground process group
    // before signaling.
    std::thread::sleep(Duration::from_millis(300));
    let sigint = parse_signal("SIGINT").expect("SIGINT should parse");
    term.send_signal(sigint).expect("signal delivery should succeed");

    let text = read_until(&term, 100, |_, is_done| is_done);
    assert!(text.contains("cmd> "), "expected prompt after interrupt, got {text:?}");
    term.close();
}

#[test]
fn binary_stdin_round_trips_through_a_copying_subprocess() {
    let term = Terminal::start().expect("terminal should spawn");
    let _ = read_until(&term, 50, |_, is_done| is_done);

    // `dd` copies exactly 4 bytes from stdin to stdout, then the shell
    // returns to its prompt.
    term.send_text("dd bs=1 count=4 2>/dev/null\n")
        .expect("send should succeed");
    std::thread::sleep(Duration::from_millis(200));

    term.send_bytes(b"\x00\xffA\n").expect("send should succeed");

    let text = read_until(&term, 100, |_, is_done| is_done);
    assert!(
        text.contains("\x00\xffA\r\n") || text.as_bytes().windows(2).any(|w| w == [0x00, 0xff]),
        "expected the four raw bytes to appear in output, got {text:?}"
    );
    term.close();
}
