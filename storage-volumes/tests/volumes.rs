// SPDX-License-Identifier: GPL-3.0-only

//! Volumes declared directly as `VolumeConfig` documents.

mod common;

use std::sync::Arc;

use common::Machine;
use storage_expr::{EnvKind, Expression};
use storage_testing::{FakeDisk, FakeHost};
use storage_types::{
    DiskSelector, FilesystemSpec, FilesystemType, GIB, LocatorSpec, MIB, MountSpec, PartitionSpec,
    ProvisioningSpec, VolumeConfigSpec, VolumeMountRequestSpec, VolumeMountStatusSpec, VolumePhase,
    VolumeStatusSpec, VolumeType,
};

const CONFIG_WRITER: &str = "VolumeConfigController";

fn disk_volume(machine: &Machine, locator: &str) {
    machine
        .store
        .modify(CONFIG_WRITER, "d-data", VolumeConfigSpec::default, |config| {
            config.spec = VolumeConfigSpec {
                volume_type: VolumeType::Disk,
                locator: LocatorSpec::DiskMatch(Expression::new(locator, EnvKind::DiskLocator)),
                ..Default::default()
            };
        })
        .unwrap();
}

/// A user volume found by partition label, provisioned on any disk.
fn data_volume(machine: &Machine, grow: bool) {
    machine
        .store
        .modify(CONFIG_WRITER, "u-data", VolumeConfigSpec::default, |config| {
            config.spec = VolumeConfigSpec {
                volume_type: VolumeType::Partition,
                locator: LocatorSpec::Match(Expression::new(
                    r#"volume.partition_label == "DATA""#,
                    EnvKind::VolumeLocator,
                )),
                provisioning: ProvisioningSpec {
                    disk_selector: DiskSelector {
                        match_expr: Expression::new("disk.size > 1u * GiB", EnvKind::DiskLocator),
                        ..Default::default()
                    },
                    partition_spec: PartitionSpec {
                        min_size: 100 * MIB,
                        max_size: if grow { 0 } else { 500 * MIB },
                        grow,
                        label: "DATA".to_string(),
                        ..Default::default()
                    },
                    filesystem_spec: FilesystemSpec {
                        filesystem_type: FilesystemType::Xfs,
                        label: "data".to_string(),
                    },
                    ..Default::default()
                },
                ..Default::default()
            };
        })
        .unwrap();
}

fn mount_request(machine: &Machine, id: &str, requester: &str, read_only: bool) {
    machine
        .store
        .modify(CONFIG_WRITER, id, VolumeMountRequestSpec::default, |request| {
            request.spec = VolumeMountRequestSpec {
                volume_id: "tmp".to_string(),
                requester: requester.to_string(),
                read_only,
            };
        })
        .unwrap();
}

#[test]
fn disk_locator_must_pick_one_disk() {
    let host = Arc::new(FakeHost::new());
    host.add_disk("/dev/sda", FakeDisk::blank(10 * GIB));
    host.add_disk("/dev/sdb", FakeDisk::blank(20 * GIB));

    let mut machine = Machine::bare(&host, &["/dev/sda", "/dev/sdb"]);
    disk_volume(&machine, "disk.size > 1u * GiB");
    machine.settle();

    let status = machine.status("d-data");
    assert_eq!(status.phase, VolumePhase::Failed);
    assert!(
        status
            .error_message
            .contains("multiple disks matched locator for disk volume"),
        "{}",
        status.error_message
    );

    // a configuration error is not retried until the configuration changes
    machine.settle();
    assert_eq!(machine.phase("d-data"), VolumePhase::Failed);

    disk_volume(&machine, "disk.size > 15u * GiB");
    machine.settle();

    let status = machine.status("d-data");
    assert_eq!(status.phase, VolumePhase::Ready, "{}", status.error_message);
    assert_eq!(status.location, "/dev/sdb");
    assert!(status.error_message.is_empty());
}

#[test]
fn requesters_share_one_mount() {
    let host = Arc::new(FakeHost::new());
    let mut machine = Machine::bare(&host, &[]);

    machine
        .store
        .modify(CONFIG_WRITER, "tmp", VolumeConfigSpec::default, |config| {
            config.spec = VolumeConfigSpec {
                volume_type: VolumeType::Tmpfs,
                mount: MountSpec {
                    target_path: "/tmp".to_string(),
                    file_mode: 0o1777,
                    ..Default::default()
                },
                ..Default::default()
            };
        })
        .unwrap();
    mount_request(&machine, "a", "A", true);
    mount_request(&machine, "b", "B", false);
    machine.settle();
    assert!(machine.errors.is_empty(), "{:#?}", machine.errors);

    // one writer is enough to mount read-write
    let mount = host.mount_at("/tmp").unwrap();
    assert_eq!(mount.filesystem, "tmpfs");
    assert!(!mount.read_only);
    assert_eq!(host.log().iter().filter(|line| *line == "mount /tmp").count(), 1);

    let a = machine.store.get::<VolumeMountStatusSpec>("a").unwrap();
    assert_eq!(a.spec.requester, "A");
    assert_eq!(a.spec.target, "/tmp");
    assert!(machine.store.get::<VolumeMountStatusSpec>("b").is_some());

    // the writer leaves, the mount stays for the reader
    machine
        .store
        .teardown::<VolumeMountRequestSpec>(CONFIG_WRITER, "b")
        .unwrap();
    machine.settle();

    let mount = host.mount_at("/tmp").unwrap();
    assert!(mount.read_only);
    assert!(host.log().contains(&"remount /tmp ro=true".to_string()));
    assert!(machine.store.get::<VolumeMountStatusSpec>("b").is_none());
    assert!(machine.store.get::<VolumeMountStatusSpec>("a").is_some());

    // the last requester leaves
    machine
        .store
        .teardown::<VolumeMountRequestSpec>(CONFIG_WRITER, "a")
        .unwrap();
    machine.settle();
    assert!(host.mount_at("/tmp").is_none());
    assert!(machine.store.get::<VolumeMountStatusSpec>("a").is_none());
}

#[test]
fn lost_status_finds_the_provisioned_partition_again() {
    let host = Arc::new(FakeHost::new());
    host.add_disk("/dev/sda", FakeDisk::blank(4 * GIB));

    let mut machine = Machine::bare(&host, &["/dev/sda"]);
    data_volume(&machine, false);
    machine.settle();

    let first = machine.status("u-data");
    assert_eq!(first.phase, VolumePhase::Ready, "{}", first.error_message);
    assert_eq!(first.partition_index, 1);
    assert!(!first.partition_uuid.is_empty());

    machine
        .store
        .teardown::<VolumeStatusSpec>("VolumeManagerController", "u-data")
        .unwrap();
    machine.settle();

    let second = machine.status("u-data");
    assert_eq!(second.phase, VolumePhase::Ready, "{}", second.error_message);
    assert_eq!(second.location, first.location);
    assert_eq!(second.partition_index, first.partition_index);
    assert_eq!(second.partition_uuid, first.partition_uuid);
    assert_eq!(second.uuid, first.uuid);

    assert_eq!(host.disk("/dev/sda").unwrap().partitions.len(), 1);
    assert_eq!(host.log().iter().filter(|line| line.starts_with("allocate")).count(), 1);
    assert_eq!(host.formatted().len(), 1);
}

#[test]
fn growing_keeps_the_filesystem() {
    let host = Arc::new(FakeHost::new());
    host.add_disk("/dev/sda", FakeDisk::blank(4 * GIB));

    let mut machine = Machine::bare(&host, &["/dev/sda"]);
    data_volume(&machine, true);
    machine.settle();

    let before = machine.status("u-data");
    assert_eq!(before.phase, VolumePhase::Ready, "{}", before.error_message);
    assert!(!before.uuid.is_empty());

    let mut disk = host.remove_disk("/dev/sda").unwrap();
    disk.size = 8 * GIB;
    host.add_disk("/dev/sda", disk);
    let log_start = host.log().len();

    let mut machine = Machine::bare(&host, &["/dev/sda"]);
    data_volume(&machine, true);
    machine.settle();

    let after = machine.status("u-data");
    assert_eq!(after.phase, VolumePhase::Ready, "{}", after.error_message);
    assert!(after.size > before.size);
    assert_eq!(after.uuid, before.uuid);
    assert_eq!(after.partition_uuid, before.partition_uuid);

    let log = host.log();
    let since = &log[log_start..];
    assert!(since.contains(&"grow /dev/sda1".to_string()), "{:#?}", since);
    assert!(since.contains(&"grow_fs /dev/sda1 xfs".to_string()), "{:#?}", since);
    assert!(!since.iter().any(|line| line.starts_with("format")), "{:#?}", since);

    let content = host.content("/dev/sda1").unwrap();
    assert_eq!(content.uuid, before.uuid);
    assert_eq!(content.label, "data");
}
