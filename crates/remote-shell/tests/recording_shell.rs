//! Behaviour of the recording shell used by dry runs

use remote_shell::{RecordingShell, RemoteShell, RemoteTarget, ShellEvent};
use std::path::Path;
use std::time::Duration;

fn target() -> RemoteTarget {
    RemoteTarget::new("i-1", "10.0.0.5", "ms101.dev.ame1.example.com")
}

#[smol_potat::test]
async fn records_uploads_and_commands_in_order() {
    let shell = RecordingShell::new("ubuntu");
    let path = shell
        .upload(Path::new("/tmp/scripts/bs.vars"), &target(), &shell.home_dir())
        .await
        .unwrap();
    assert_eq!(path, "/home/ubuntu/bs.vars");

    let code = shell.run(&target(), "sudo -uroot \"/home/ubuntu/bs.vars\"").await.unwrap();
    assert_eq!(code, 0);

    let events = shell.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ShellEvent::Upload { .. }));
    assert_eq!(shell.commands_for("i-1"), vec!["sudo -uroot \"/home/ubuntu/bs.vars\""]);
    assert!(shell.commands_for("i-2").is_empty());
}

#[smol_potat::test]
async fn configured_failures_and_unreachable_hosts() {
    let shell = RecordingShell::new("ubuntu");
    shell.fail_matching("hooks", 3);
    shell.set_unreachable("10.0.0.5");

    assert_eq!(shell.run(&target(), "run hooks").await.unwrap(), 3);
    assert_eq!(shell.run(&target(), "uptime").await.unwrap(), 0);
    assert!(!shell.reachable(&target(), Duration::from_millis(10)).await);

    let other = RemoteTarget::new("i-2", "10.0.0.6", "ms102.dev.ame1.example.com");
    assert!(shell.reachable(&other, Duration::from_millis(10)).await);
}
