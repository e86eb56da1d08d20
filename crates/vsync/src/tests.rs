//! Multi-host scenarios over the in-memory network.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;
use vsync_transport::MemoryNetwork;
use vsync_types::{CheckpointId, HostId, ProcessId, Ticket};

use crate::{Group, GroupConfig, Identity, ViewStatus, VsyncError};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

struct Host {
    group: Group,
    dir: TempDir,
}

impl Host {
    fn id(&self) -> HostId {
        self.group.local()
    }
}

fn start_host(net: &MemoryNetwork, ticket: u32) -> Host {
    start_host_with(net, ticket, |config| config)
}

fn start_host_with(
    net: &MemoryNetwork,
    ticket: u32,
    configure: impl FnOnce(GroupConfig) -> GroupConfig,
) -> Host {
    let dir = TempDir::new().unwrap();
    let config = configure(GroupConfig::testing(dir.path()));
    let identity = Identity::generate().with_ticket(Ticket::new(ticket));
    let transport = net.endpoint(identity.presence());
    let group = Group::start(config, identity, Arc::new(transport)).unwrap();
    Host { group, dir }
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn sorted(mut hosts: Vec<HostId>) -> Vec<HostId> {
    hosts.sort();
    hosts
}

/// Waits until every host is active in one view managed by `manager`.
fn wait_settled(hosts: &[&Host], manager: &Host) {
    for host in hosts {
        let expected = sorted(
            hosts
                .iter()
                .map(|h| h.id())
                .filter(|id| *id != host.id())
                .collect(),
        );
        wait_for("settled view", || {
            host.group.status() == ViewStatus::Active
                && host.group.manager() == Some(manager.id())
                && sorted(host.group.members()) == expected
        });
    }
}

fn receive(host: &Host) -> Bytes {
    host.group
        .receive_stable_timeout(RECEIVE_TIMEOUT)
        .unwrap()
        .expect("delivery within timeout")
}

#[test]
fn test_higher_ticket_becomes_manager() {
    let net = MemoryNetwork::new();
    let low = start_host(&net, 10);
    let high = start_host(&net, 20);

    wait_settled(&[&low, &high], &high);

    assert!(high.group.is_manager());
    assert!(!low.group.is_manager());
    assert_eq!(high.group.process_id(), Some(ProcessId::ZERO));
    assert_eq!(low.group.process_id(), Some(ProcessId::new(1)));
    assert_eq!(high.group.view().substitute(), Some(low.id()));
}

#[test]
fn test_lone_host_holds_sends() {
    let net = MemoryNetwork::new();
    let host = start_host(&net, 10);

    host.group.send(&b"early"[..]).unwrap();

    let got = host
        .group
        .receive_stable_timeout(Duration::from_millis(200))
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(host.group.status(), ViewStatus::Unconnected);
    assert!(host.group.members().is_empty());
}

#[test]
fn test_third_host_is_admitted() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let first = start_host(&net, 10);
    wait_settled(&[&manager, &first], &manager);

    let second = start_host(&net, 20);
    wait_settled(&[&manager, &first, &second], &manager);

    assert_eq!(second.group.process_id(), Some(ProcessId::new(2)));
    assert!(net.links_of(first.id()).contains(&second.id()));
}

#[test]
fn test_broadcast_is_delivered_once_everywhere() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let a = start_host(&net, 10);
    wait_settled(&[&manager, &a], &manager);
    let b = start_host(&net, 20);
    wait_settled(&[&manager, &a, &b], &manager);

    manager.group.send(&b"hello"[..]).unwrap();

    for host in [&manager, &a, &b] {
        assert_eq!(receive(host), Bytes::from_static(b"hello"));
    }
    wait_for("manager acks", || manager.group.reliability().tracker().is_empty());

    for host in [&manager, &a, &b] {
        let extra = host
            .group
            .receive_stable_timeout(Duration::from_millis(200))
            .unwrap();
        assert_eq!(extra, None);
    }
}

#[test]
fn test_concurrent_senders_agree_on_order() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let a = start_host(&net, 10);
    wait_settled(&[&manager, &a], &manager);
    let b = start_host(&net, 20);
    wait_settled(&[&manager, &a, &b], &manager);

    for round in 0..5u8 {
        manager.group.send(vec![b'm', round]).unwrap();
        a.group.send(vec![b'a', round]).unwrap();
        b.group.send(vec![b'b', round]).unwrap();
    }

    let streams: Vec<Vec<Bytes>> = [&manager, &a, &b]
        .iter()
        .map(|host| (0..15).map(|_| receive(host)).collect())
        .collect();

    assert_eq!(streams[0], streams[1]);
    assert_eq!(streams[1], streams[2]);
}

#[test]
fn test_silent_member_is_declared_disconnected() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let a = start_host(&net, 10);
    wait_settled(&[&manager, &a], &manager);
    let silent = start_host(&net, 20);
    wait_settled(&[&manager, &a, &silent], &manager);

    net.isolate(silent.id());
    manager.group.send(&b"after isolation"[..]).unwrap();

    wait_for("silent member disconnected", || {
        net.disconnects_by(manager.id()).contains(&silent.id())
    });
    wait_settled(&[&manager, &a], &manager);

    assert_eq!(receive(&a), Bytes::from_static(b"after isolation"));
    assert!(manager.group.reliability().is_suspect(silent.id()));
}

#[test]
fn test_manager_failure_promotes_substitute() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let a = start_host(&net, 10);
    wait_settled(&[&manager, &a], &manager);
    let b = start_host(&net, 20);
    wait_settled(&[&manager, &a, &b], &manager);

    let substitute = manager.group.view().substitute().unwrap();
    assert_eq!(substitute, a.id());

    net.crash(manager.id());
    wait_settled(&[&a, &b], &a);

    a.group.send(&b"new manager"[..]).unwrap();
    assert_eq!(receive(&b), Bytes::from_static(b"new manager"));
}

#[test]
fn test_log_threshold_triggers_checkpoint() {
    let net = MemoryNetwork::new();
    let manager = start_host_with(&net, 30, |c| c.with_log_threshold(3));
    let member = start_host_with(&net, 10, |c| c.with_log_threshold(3));
    wait_settled(&[&manager, &member], &manager);
    let before = manager.group.recovery().counter();

    for body in [&b"one"[..], b"two", b"three"] {
        manager.group.send(body).unwrap();
    }

    wait_for("manager checkpoint", || {
        manager.group.recovery().counter() == before.next()
            && manager.group.recovery().log_len() == 0
    });
    let path = manager.group.recovery().store().checkpoint_path(before);
    assert!(path.exists());
    assert!(path.starts_with(manager.dir.path()));

    wait_for("member adopts checkpoint", || {
        member.group.recovery().last_checkpoint() == Some(before)
    });
    assert_eq!(member.group.recovery().counter(), before.next());
}

#[test]
fn test_restarted_host_recovers_missed_checkpoints() {
    let net = MemoryNetwork::new();
    let manager = start_host(&net, 30);
    let mut member = start_host(&net, 10);
    wait_settled(&[&manager, &member], &manager);
    let process_id = member.group.process_id();

    manager.group.send(&b"one"[..]).unwrap();
    manager.group.send(&b"two"[..]).unwrap();
    assert_eq!(receive(&member), Bytes::from_static(b"one"));
    assert_eq!(receive(&member), Bytes::from_static(b"two"));
    wait_for("log filled", || manager.group.recovery().log_len() == 2);

    // Crash the member; the manager checkpoints while removing it.
    let member_id = member.id();
    net.crash(member_id);
    member.group.shutdown();
    wait_for("member removed", || manager.group.members().is_empty());
    wait_for("failure checkpoint", || {
        manager.group.recovery().last_checkpoint() == Some(CheckpointId::ZERO)
    });

    let identity = Identity::load_or_generate(member.dir.path()).unwrap();
    assert!(identity.is_restored());
    assert_eq!(identity.host, member_id);

    let transport = net.endpoint(identity.presence());
    let config = GroupConfig::testing(member.dir.path());
    let restarted = Host {
        group: Group::start(config, identity, Arc::new(transport)).unwrap(),
        dir: member.dir,
    };

    assert_eq!(receive(&restarted), Bytes::from_static(b"one"));
    assert_eq!(receive(&restarted), Bytes::from_static(b"two"));
    wait_settled(&[&manager, &restarted], &manager);
    assert_eq!(restarted.group.process_id(), process_id);
    assert_eq!(
        restarted.group.recovery().last_checkpoint(),
        Some(CheckpointId::ZERO)
    );
}

#[test]
fn test_shut_down_group_rejects_calls() {
    let net = MemoryNetwork::new();
    let mut host = start_host(&net, 10);

    host.group.shutdown();
    host.group.shutdown();

    assert!(host.group.is_shut_down());
    assert!(matches!(host.group.send(&b"late"[..]), Err(VsyncError::ShutDown)));
    assert!(matches!(host.group.receive_stable(), Err(VsyncError::ShutDown)));
}
