//! Ring scan scenarios: discovery, identification, SII image sharing and topology flags.

mod util;

use carapace::{MainDevice, MainDeviceConfig, SubDeviceState, Timeouts};
use std::sync::Arc;
use util::{Sim, SimSubDevice, SiiBuilder};

fn engine() -> MainDevice {
    MainDevice::new(Timeouts::default(), MainDeviceConfig::default())
}

fn coe_device(sii: &SiiBuilder) -> SimSubDevice {
    let mut device = SimSubDevice::new(sii);

    // Default PDO assignment served over CoE: SM3 carries PDO 0x1a00 with two 16 bit
    // channels
    device.dictionary.insert((0x1c12, 0), vec![0]);
    device.dictionary.insert((0x1c13, 0), vec![1]);
    device
        .dictionary
        .insert((0x1c13, 1), 0x1a00u16.to_le_bytes().to_vec());
    device.dictionary.insert((0x1a00, 0), vec![2]);
    device
        .dictionary
        .insert((0x1a00, 1), 0x6000_0110u32.to_le_bytes().to_vec());
    device
        .dictionary
        .insert((0x1a00, 2), 0x6000_0210u32.to_le_bytes().to_vec());

    device
}

#[test]
fn scan_single_coe_device() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut engine = engine();
    let mut sim = Sim::new(vec![coe_device(&sii)]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert!(engine.scan_complete());
    assert_eq!(engine.subdevices().len(), 1);

    let sub = engine.subdevice(0).unwrap();

    assert!(!sub.error_flag());
    assert_eq!(sub.configured_address(), 0x1000);
    assert_eq!(sub.current_state(), SubDeviceState::PreOp);
    assert_eq!(sub.name(), "sim device");

    let identity = sub.identity();

    assert_eq!(identity.vendor_id, 0x0000_000b);
    assert_eq!(identity.product_id, 0x0000_1234);
    assert_eq!(identity.revision, 1);
    assert_eq!(identity.serial, 42);

    // The effective read mailbox window comes from the configured SM1, not the SII directly
    assert_eq!(sub.configured_read_mailbox_len(), 256);
    assert_eq!(sub.configured_write_mailbox_len(), 256);

    // The SII image carries all four sync manager descriptors
    let image = sub.sii_image().unwrap();

    assert_eq!(image.sync_managers.len(), 4);

    // The PDO set was read over CoE: 0x1a00 attached to SM3 with exactly two entries
    let pdos = sub.pdos();

    assert_eq!(pdos.len(), 1);
    assert_eq!(pdos[0].index, 0x1a00);
    assert_eq!(pdos[0].sync_manager, Some(3));
    assert_eq!(pdos[0].entries.len(), 2);
    assert_eq!(pdos[0].entries[0].index, 0x6000);
    assert_eq!(pdos[0].entries[0].sub_index, 1);
    assert_eq!(pdos[0].entries[0].bit_length, 16);
    assert_eq!(pdos[0].entries[1].sub_index, 2);

    // The dictionary was not requested, so it stays empty
    assert!(sub.dictionary().is_empty());
}

#[test]
fn identical_devices_share_one_sii_image() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut engine = engine();
    let mut sim = Sim::new(vec![coe_device(&sii), coe_device(&sii)]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 1000);

    assert!(engine.scan_complete());

    let first = engine.subdevice(0).unwrap();
    let second = engine.subdevice(1).unwrap();

    // Same parsed image object, not merely equal contents
    assert!(Arc::ptr_eq(
        first.sii_image().unwrap(),
        second.sii_image().unwrap()
    ));

    // Structurally equal sync manager lists through the shared image
    assert_eq!(
        first.sii_image().unwrap().sync_managers,
        second.sii_image().unwrap().sync_managers
    );

    // The identity probe is 8 word-read requests; the first device's full read issues many
    // more. The second device must have been served by the cache and never read past the
    // probe.
    let sii_requests = |device: &util::SimSubDevice| {
        device
            .writes
            .iter()
            .filter(|(_, register, _)| *register == 0x0502)
            .count()
    };

    assert_eq!(sii_requests(&sim.devices[1]), 8);
    assert!(sii_requests(&sim.devices[0]) > 8);

    // The CoE PDO read is also cached by identity
    assert_eq!(first.pdos(), second.pdos());
}

#[test]
fn bypassed_ports_are_flagged() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut device = coe_device(&sii).with_dc();

    device.bypassed_ports = vec![1, 2, 3];

    let mut engine = engine();
    let mut sim = Sim::new(vec![device]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    let sub = engine.subdevice(0).unwrap();

    let ports = sub.ports();

    assert!(!ports.0[0].bypassed);
    assert!(ports.0[1].bypassed);
    assert!(ports.0[2].bypassed);
    assert!(ports.0[3].bypassed);

    // Ports 0/1 have link per the DL status register; port 1 loops back
    assert!(ports.0[0].link_up);
    assert!(ports.0[1].link_up);
}

#[test]
fn device_without_mailbox_scans_to_init_only() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut sii = SiiBuilder::default();

    sii.protocols = 0;
    sii.mailbox_size = 0;

    let mut engine = engine();
    let mut sim = Sim::new(vec![SimSubDevice::new(&sii)]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert!(engine.scan_complete());

    let sub = engine.subdevice(0).unwrap();

    assert!(!sub.error_flag());
    // No mailbox bringup happened, the device stays in INIT
    assert_eq!(sub.current_state(), SubDeviceState::Init);
    assert_eq!(sub.configured_read_mailbox_len(), 0);
}

#[test]
fn slow_eeprom_load_is_retried() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut device = coe_device(&sii);

    // The first status reads report the EEPROM still loading
    device.sii_loading_reads = 10;

    let mut engine = engine();
    let mut sim = Sim::new(vec![device]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 800);

    let sub = engine.subdevice(0).unwrap();

    assert!(!sub.error_flag());
    assert_eq!(sub.current_state(), SubDeviceState::PreOp);
    assert_eq!(sub.identity().serial, 42);
}
