//! Configuration scenarios: driving a SubDevice to OP, error acknowledgement, distributed
//! clocks and quick reconfiguration.

mod util;

use carapace::{
    AlStatusCode, DcConfig, FmmuMapping, MainDevice, MainDeviceConfig, Pdo, PdoEntry,
    SubDeviceConfig, SubDeviceState, Timeouts,
};
use util::{AlScript, Sim, SimSubDevice, SiiBuilder};

fn engine() -> MainDevice {
    MainDevice::new(Timeouts::default(), MainDeviceConfig::default())
}

fn coe_device(sii: &SiiBuilder) -> SimSubDevice {
    let mut device = SimSubDevice::new(sii);

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

fn entry(index: u16, sub_index: u8, bit_length: u8) -> PdoEntry {
    PdoEntry {
        index,
        sub_index,
        bit_length,
        name: heapless::String::new(),
    }
}

fn desired_config() -> SubDeviceConfig {
    SubDeviceConfig {
        pdos: vec![Pdo {
            index: 0x1a00,
            sync_manager: Some(3),
            name: heapless::String::new(),
            entries: vec![entry(0x6000, 1, 16), entry(0x6000, 2, 16)],
        }],
        fmmus: vec![FmmuMapping {
            logical_start_address: 0,
            length_bytes: 4,
            sync_manager: 3,
            read: true,
            write: false,
        }],
        ..SubDeviceConfig::default()
    }
}

#[test]
fn configure_to_op() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut engine = engine();
    let mut sim = Sim::new(vec![coe_device(&sii)]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert!(engine.scan_complete());

    // Baseline: the scan requested PRE-OP once
    let scan_writes = sim.devices[0].writes.len();

    engine.attach_config(0, desired_config()).unwrap();
    engine.request_state(0, SubDeviceState::Op).unwrap();

    util::run(&mut engine, &mut sim, 1000);

    let sub = engine.subdevice(0).unwrap();

    assert!(!sub.error_flag());
    assert_eq!(sub.current_state(), SubDeviceState::Op);
    assert_eq!(sim.devices[0].al_state(), 0x08);

    let config_writes = &sim.devices[0].writes[scan_writes..];

    // The state ladder ran INIT → PRE-OP → SAFE-OP → OP
    let states: Vec<u8> = config_writes
        .iter()
        .filter(|(_, register, _)| *register == 0x0120)
        .map(|(_, _, data)| data[0] & 0x0f)
        .collect();

    assert_eq!(states, vec![0x01, 0x02, 0x04, 0x08]);

    // Exactly one FMMU configuration write (16 bytes at FMMU 0)
    let fmmu_writes: Vec<_> = config_writes
        .iter()
        .filter(|(_, register, data)| *register == 0x0600 && data.len() == 16)
        .collect();

    assert_eq!(fmmu_writes.len(), 1);
    // Logical start, then length 4
    assert_eq!(&fmmu_writes[0].2[0..6], &[0, 0, 0, 0, 4, 0]);
    // Mapped onto SM3's window at 0x1300
    assert_eq!(&fmmu_writes[0].2[8..10], &[0x00, 0x13]);

    // SM3 got its process data configuration: 4 bytes at its SII start address
    let sm3_writes: Vec<_> = config_writes
        .iter()
        .filter(|(_, register, _)| *register == 0x0818)
        .collect();

    assert_eq!(sm3_writes.len(), 1);
    assert_eq!(&sm3_writes[0].2[0..4], &[0x00, 0x13, 0x04, 0x00]);

    // No DC was configured, so no start time write happened
    assert!(
        !config_writes
            .iter()
            .any(|(_, register, _)| *register == 0x0990)
    );

    // The PDO plan was written over CoE in the required order: clear assign, clear mapping,
    // entries, mapping count, assign entries, assign count
    assert_eq!(
        sim.devices[0].dictionary.get(&(0x1c13, 0)),
        Some(&vec![1u8])
    );
    assert_eq!(
        sim.devices[0].dictionary.get(&(0x1a00, 0)),
        Some(&vec![2u8])
    );
}

#[test]
fn configure_with_distributed_clocks() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut device = coe_device(&sii).with_dc();

    // The sync difference converges on the second poll
    device.sync_diffs.extend([50_000u32, 5_000]);

    let mut engine = engine();
    let mut sim = Sim::new(vec![device]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    let mut config = desired_config();

    config.dc = Some(DcConfig {
        assign_activate: 0x0300,
        sync0_cycle_ns: 1_000_000,
        sync0_shift_ns: 0,
        sync1_cycle_ns: 0,
    });

    engine.attach_config(0, config).unwrap();
    engine.request_state(0, SubDeviceState::Op).unwrap();

    util::run(&mut engine, &mut sim, 1000);

    let sub = engine.subdevice(0).unwrap();

    assert_eq!(sub.current_state(), SubDeviceState::Op);

    let writes = &sim.devices[0].writes;

    // Cycle times, start time and activation were all written
    let cycle = writes
        .iter()
        .find(|(_, register, _)| *register == 0x09a0)
        .expect("cycle time write");

    assert_eq!(&cycle.2[0..4], &1_000_000u32.to_le_bytes());

    assert!(writes.iter().any(|(_, register, _)| *register == 0x0990));

    let activate = writes
        .iter()
        .filter(|(_, register, _)| *register == 0x0980)
        .last()
        .expect("activation write");

    assert_eq!(&activate.2[0..2], &0x0300u16.to_le_bytes());
}

#[test]
fn refused_transition_is_acknowledged_then_recovers() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    // The device refuses SAFE-OP once with a synchronisation error, then accepts after the
    // acknowledge
    let device = coe_device(&sii).with_al_script(AlScript {
        delay_polls: 0,
        error_once: Some((0x04, 0x001a)),
    });

    let mut engine = engine();
    let mut sim = Sim::new(vec![device]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    engine.attach_config(0, desired_config()).unwrap();
    engine.request_state(0, SubDeviceState::Op).unwrap();

    util::run(&mut engine, &mut sim, 1000);

    let sub = engine.subdevice(0).unwrap();

    assert!(!sub.error_flag());
    assert_eq!(sub.current_state(), SubDeviceState::Op);
    assert_eq!(
        sub.last_al_status_code(),
        Some(AlStatusCode::SynchronizationError)
    );

    // Exactly one acknowledge write went out
    let acks = sim.devices[0]
        .writes
        .iter()
        .filter(|(_, register, data)| *register == 0x0120 && data[0] & 0x10 != 0)
        .count();

    assert_eq!(acks, 1);
}

#[test]
fn transition_completes_after_scripted_poll_delay() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let device = coe_device(&sii).with_al_script(AlScript {
        delay_polls: 3,
        error_once: None,
    });

    let mut engine = engine();
    let mut sim = Sim::new(vec![coe_device(&sii)]);

    sim.devices[0] = device;

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert_eq!(
        engine.subdevice(0).unwrap().current_state(),
        SubDeviceState::PreOp
    );

    let before = sim.devices[0].al_status_reads;

    engine.attach_config(0, SubDeviceConfig::default()).unwrap();
    engine.request_state(0, SubDeviceState::Init).unwrap();

    util::run(&mut engine, &mut sim, 200);

    assert_eq!(
        engine.subdevice(0).unwrap().current_state(),
        SubDeviceState::Init
    );

    // The scripted delay makes the machine poll the status register exactly
    // `delay_polls + 1` times for the single transition
    assert_eq!(sim.devices[0].al_status_reads - before, 4);
}

#[test]
fn quick_reconfigure_skips_register_setup() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut engine = engine();
    let mut sim = Sim::new(vec![coe_device(&sii)]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    engine.attach_config(0, desired_config()).unwrap();
    engine.request_state(0, SubDeviceState::SafeOp).unwrap();

    util::run(&mut engine, &mut sim, 1000);

    assert_eq!(
        engine.subdevice(0).unwrap().current_state(),
        SubDeviceState::SafeOp
    );

    let writes_before = sim.devices[0].writes.len();

    // Jump to OP from SAFE-OP without re-running the register configuration
    engine.quick_reconfigure(0).unwrap();
    engine.request_state(0, SubDeviceState::Op).unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert_eq!(
        engine.subdevice(0).unwrap().current_state(),
        SubDeviceState::Op
    );

    let late_writes = &sim.devices[0].writes[writes_before..];

    // No INIT transition, no FMMU/SM wipes: only the OP request
    assert_eq!(requested_states_slice(late_writes), vec![0x08]);
    assert!(
        !late_writes
            .iter()
            .any(|(_, register, _)| *register == 0x0600 || *register == 0x0800)
    );
}

fn requested_states_slice(writes: &[(u8, u16, Vec<u8>)]) -> Vec<u8> {
    writes
        .iter()
        .filter(|(_, register, _)| *register == 0x0120)
        .filter(|(_, _, data)| data[0] & 0x10 == 0)
        .map(|(_, _, data)| data[0] & 0x0f)
        .collect()
}
