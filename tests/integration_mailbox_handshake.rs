#![cfg(unix)]

use accel_bench::coordination::{Mailbox, MailboxKey};
use os_pipe::pipe;
use std::io::Read;
use std::process::{Child, Command, Stdio};

/// Spawn `sh -c script` with its stdout connected to a fresh pipe and deposit
/// the read end in `mailbox`.
fn spawn_into(mailbox: &mut Mailbox, script: &str) -> (MailboxKey, Child) {
    let (reader, writer) = pipe().expect("create pipe");

    // The command holds the write end; it must be dropped before reading or
    // the parent keeps the pipe open and never sees EOF.
    let child = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(Stdio::null());
        cmd.spawn().expect("spawn child")
    };

    let key = MailboxKey {
        parent: std::process::id(),
        child: child.id(),
    };
    mailbox.deposit(key, Box::new(reader) as Box<dyn Read + Send>);
    (key, child)
}

#[test]
fn child_entry_arrives_through_stdout_pipe() {
    let mut mailbox = Mailbox::new();
    let (key, mut child) = spawn_into(
        &mut mailbox,
        "sleep 0.05; printf '1000\\n9000\\n20\\n90\\n45\\n64\\n'",
    );
    assert!(child.wait().expect("wait child").success());

    let entry = mailbox.take(&key).expect("slot present").expect("valid entry");
    assert_eq!(entry.window.start_ns, 1000);
    assert_eq!(entry.window.end_ns, 9000);
    assert_eq!(entry.count, 64);
    assert_eq!(entry.latency().mean_ns(), Some(45));
    assert!(mailbox.is_empty());
}

#[test]
fn failed_child_contributes_nothing() {
    let mut mailbox = Mailbox::new();
    let (_, mut ok) = spawn_into(
        &mut mailbox,
        "printf '0\\n100\\n9223372036854775807\\n-9223372036854775808\\n0\\n5\\n'",
    );
    let (_, mut crashed) = spawn_into(&mut mailbox, "printf '0\\n100\\n'; exit 3");
    assert!(ok.wait().expect("wait child").success());
    assert!(!crashed.wait().expect("wait child").success());

    let entries = mailbox.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.count, 5);
    assert!(entries[0].1.latency().is_empty());
}
