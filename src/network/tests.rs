use super::{AddressAllocator, CommandRunner, TrafficRedirector, VirtualLinkPair};
use crate::errors::RecordError;
use crate::test_support::RecordingRunner;
use ipnetwork::Ipv4Network;
use nix::unistd::Pid;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

fn net(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::new(a, b, c, d), prefix).unwrap()
}

fn recording() -> (Rc<RecordingRunner>, Rc<dyn CommandRunner>) {
    let runner = Rc::new(RecordingRunner::new());
    let dynamic: Rc<dyn CommandRunner> = runner.clone();
    (runner, dynamic)
}

#[test]
fn allocator_skips_subnets_assigned_to_host() {
    let allocator = AddressAllocator::new(vec![
        net(100, 64, 1, 1, 24),
        net(100, 64, 2, 7, 32),
    ]);

    let allocation = allocator.allocate(1).unwrap();
    assert_eq!(allocation.octet, 3);
    assert_eq!(allocation.subnet, net(100, 64, 3, 0, 24));
    assert_eq!(allocation.address, Ipv4Addr::new(100, 64, 3, 1));
    assert_eq!(allocation.next_hint(), 4);
}

#[test]
fn allocator_treats_wide_host_networks_as_covering_candidates() {
    let allocator = AddressAllocator::new(vec![net(100, 64, 0, 0, 10)]);
    let err = allocator.allocate(1).unwrap_err();
    assert!(matches!(err, RecordError::AllocationExhausted { .. }));
}

#[test]
fn allocator_pair_is_disjoint_from_each_other_and_host() {
    let host = vec![
        net(127, 0, 0, 1, 8),
        net(192, 168, 1, 20, 24),
        net(100, 64, 1, 1, 24),
        net(100, 64, 3, 1, 24),
    ];
    let allocator = AddressAllocator::new(host.clone());

    let (first, second) = allocator.allocate_pair(1).unwrap();

    assert!(second.octet > first.octet);
    assert!(!first.subnet.overlaps(second.subnet));
    for taken in &host {
        assert!(!taken.overlaps(first.subnet));
        assert!(!taken.overlaps(second.subnet));
    }
    assert_eq!(first.octet, 2);
    assert_eq!(second.octet, 4);
}

#[test]
fn allocator_honours_start_hint() {
    let allocator = AddressAllocator::new(Vec::new());
    assert_eq!(allocator.allocate(200).unwrap().octet, 200);
    assert_eq!(allocator.allocate(0).unwrap().octet, 1);
}

#[test]
fn allocator_exhausts_past_last_octet() {
    let allocator = AddressAllocator::new(Vec::new());
    assert!(allocator.allocate(255).is_ok());
    assert!(matches!(
        allocator.allocate(256),
        Err(RecordError::AllocationExhausted { start: 256, probes: 0 })
    ));
}

#[test]
fn allocator_reserve_blocks_later_allocations() {
    let mut allocator = AddressAllocator::new(Vec::new());
    let first = allocator.allocate(1).unwrap();
    allocator.reserve(first.subnet);
    assert_eq!(allocator.allocate(1).unwrap().octet, 2);
}

#[test]
fn allocator_from_host_sees_loopback() {
    let allocator = AddressAllocator::from_host().unwrap();
    assert!(
        allocator
            .assigned()
            .iter()
            .any(|n| n.contains(Ipv4Addr::LOCALHOST))
    );
}

#[test]
fn veth_create_rejects_bad_names() {
    let (_, runner) = recording();
    assert!(VirtualLinkPair::create(runner.clone(), "", "veth-i1").is_err());
    assert!(VirtualLinkPair::create(runner.clone(), "veth-0123456789abc", "b").is_err());
    assert!(VirtualLinkPair::create(runner.clone(), "same", "same").is_err());
    assert!(VirtualLinkPair::create(runner, "bad name", "b").is_err());
}

#[test]
fn veth_create_collision_is_device_error() {
    let (recorder, runner) = recording();
    let _pair = VirtualLinkPair::create(runner.clone(), "veth-1", "veth-i1").unwrap();

    let err = VirtualLinkPair::create(runner, "veth-i1", "veth-2")
        .err()
        .expect("name collision must fail");
    assert_eq!(err.category(), "DeviceError");
    assert_eq!(recorder.links().len(), 1);
}

#[test]
fn veth_drop_deletes_pair_when_still_owned() {
    let (recorder, runner) = recording();
    {
        let _pair = VirtualLinkPair::create(runner, "veth-1", "veth-i1").unwrap();
        assert_eq!(recorder.links().len(), 1);
    }
    assert!(recorder.links().is_empty());
    assert!(recorder.command_lines().contains(&"ip link del veth-1".to_string()));
}

#[test]
fn veth_release_is_noop_once_externally_owned() {
    let (recorder, runner) = recording();
    let mut pair = VirtualLinkPair::create(runner, "veth-1", "veth-i1").unwrap();
    pair.move_to_namespace("veth-i1", Pid::from_raw(4242)).unwrap();
    assert!(!pair.is_externally_owned());
    pair.mark_externally_owned();
    assert!(pair.is_externally_owned());
    recorder.destroy_link("veth-i1");

    pair.release();
    drop(pair);

    assert!(
        !recorder
            .command_lines()
            .iter()
            .any(|line| line.starts_with("ip link del"))
    );
}

#[test]
fn veth_release_tolerates_pair_already_gone() {
    let (recorder, runner) = recording();
    let mut pair = VirtualLinkPair::create(runner, "veth-1", "veth-i1").unwrap();
    recorder.destroy_link("veth-1");

    pair.release();
    pair.release();
    drop(pair);

    let deletes = recorder
        .command_lines()
        .iter()
        .filter(|line| line.starts_with("ip link del"))
        .count();
    assert_eq!(deletes, 1);
}

#[test]
fn veth_assign_and_move_only_accept_members() {
    let (recorder, runner) = recording();
    let pair = VirtualLinkPair::create(runner, "veth-1", "veth-i1").unwrap();

    pair.assign(
        "veth-1",
        Ipv4Addr::new(100, 64, 1, 1),
        Ipv4Addr::new(100, 64, 2, 1),
    )
    .unwrap();
    assert!(pair.move_to_namespace("eth0", Pid::from_raw(1)).is_err());

    let lines = recorder.command_lines();
    assert!(lines.contains(&"ip addr add 100.64.1.1 peer 100.64.2.1 dev veth-1".to_string()));
    assert!(lines.contains(&"ip link set dev veth-1 up".to_string()));
}

#[test]
fn nat_rule_is_removed_on_drop() {
    let (recorder, runner) = recording();
    let redirector = TrafficRedirector::new(runner, "recordshell-1");
    {
        let nat = redirector.install_nat(net(100, 64, 2, 0, 24)).unwrap();
        assert_eq!(nat.rule().chain(), "POSTROUTING");
        assert_eq!(recorder.installed_rules().len(), 1);
    }
    assert!(recorder.installed_rules().is_empty());
}

#[test]
fn dnat_second_identical_install_is_rule_conflict() {
    let (recorder, runner) = recording();
    let redirector = TrafficRedirector::new(runner, "recordshell-1");
    let target = SocketAddrV4::new(Ipv4Addr::new(100, 64, 1, 1), 40000);

    let first = redirector.install_dnat(target, "veth-1").unwrap();
    let second = redirector.install_dnat(target, "veth-1");

    assert!(matches!(second, Err(RecordError::RuleConflict(_))));
    assert_eq!(recorder.installed_rules().len(), 1);
    assert_eq!(first.target(), target);
    assert_eq!(first.interface(), "veth-1");

    drop(first);
    assert!(recorder.installed_rules().is_empty());
}

#[test]
fn nat_second_identical_install_is_rule_conflict() {
    let (_, runner) = recording();
    let redirector = TrafficRedirector::new(runner, "recordshell-1");
    let _nat = redirector.install_nat(net(100, 64, 2, 0, 24)).unwrap();
    assert!(matches!(
        redirector.install_nat(net(100, 64, 2, 0, 24)),
        Err(RecordError::RuleConflict(_))
    ));
}

#[test]
fn dnat_redirects_any_destination() {
    let (recorder, runner) = recording();
    let redirector = TrafficRedirector::new(runner, "recordshell-9");
    let _dnat = redirector
        .install_dnat(SocketAddrV4::new(Ipv4Addr::new(100, 64, 1, 1), 8080), "veth-9")
        .unwrap();

    let rules = recorder.installed_rules();
    let (chain, args) = &rules[0];
    assert_eq!(chain, "PREROUTING");
    assert!(!args.contains(&"-d".to_string()));
    assert!(args.ends_with(&["--to-destination".to_string(), "100.64.1.1:8080".to_string()]));
}

#[test]
fn rules_release_once_in_any_order() {
    let (recorder, runner) = recording();
    let redirector = TrafficRedirector::new(runner, "recordshell-1");
    let mut nat = redirector.install_nat(net(100, 64, 2, 0, 24)).unwrap();
    let mut dnat = redirector
        .install_dnat(SocketAddrV4::new(Ipv4Addr::new(100, 64, 1, 1), 1), "veth-1")
        .unwrap();

    dnat.release();
    nat.release();
    nat.release();
    drop(dnat);
    drop(nat);

    let deletes = recorder
        .commands()
        .iter()
        .filter(|c| c.get(3).map(String::as_str) == Some("-D"))
        .count();
    assert_eq!(deletes, 2);
    assert!(recorder.installed_rules().is_empty());
}

#[test]
fn failed_rule_append_leaves_nothing_installed() {
    let (recorder, runner) = recording();
    recorder.fail_when("-A POSTROUTING");
    let redirector = TrafficRedirector::new(runner, "recordshell-1");

    let err = redirector
        .install_nat(net(100, 64, 2, 0, 24))
        .err()
        .expect("append failure must surface");
    assert_eq!(err.category(), "Syscall");
    assert!(recorder.installed_rules().is_empty());
}
