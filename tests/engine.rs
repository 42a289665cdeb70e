//! Engine-level behaviour: shutdown safety and mailbox sharing between the lifecycle and
//! request lanes.

mod util;

use carapace::{
    Instant, MainDevice, MainDeviceConfig, SdoConfigItem, SdoRequest, SdoRequestState,
    SubDeviceConfig, SubDeviceState, Timeouts,
};
use util::{Sim, SimSubDevice, SiiBuilder};

fn scanned_pair() -> (MainDevice, Sim) {
    let _ = env_logger::builder().is_test(true).try_init();

    let sii = SiiBuilder::default();

    let mut device = SimSubDevice::new(&sii);

    device.dictionary.insert((0x1c13, 0), vec![0]);
    device.dictionary.insert((0x6000, 1), vec![1, 2, 3, 4]);

    let mut engine = MainDevice::new(Timeouts::default(), MainDeviceConfig::default());
    let mut sim = Sim::new(vec![device]);

    engine.scan().unwrap();

    util::run(&mut engine, &mut sim, 500);

    assert!(engine.scan_complete());

    (engine, sim)
}

#[test]
fn shutdown_fails_every_pending_request() {
    let (mut engine, mut sim) = scanned_pair();

    // Queue several requests and let the first one get part-way through its exchange
    let handles: Vec<_> = (0..4)
        .map(|_| {
            engine
                .submit_request(0, SdoRequest::upload(0x6000, 1), Instant::ZERO)
                .unwrap()
        })
        .collect();

    util::run(&mut engine, &mut sim, 2);

    engine.shutdown();

    // No request may remain in a non-terminal state
    for handle in handles {
        let request = engine.request(handle).expect("request still visible");

        assert!(
            matches!(
                request.state(),
                SdoRequestState::Success | SdoRequestState::Failure
            ),
            "request left in {:?}",
            request.state()
        );
    }
}

#[test]
fn request_lane_shares_the_mailbox_with_configuration() {
    let (mut engine, mut sim) = scanned_pair();

    // The configuration applies SDO writes over the lifecycle lane while the application
    // request drains over the request lane; the advisory lock keeps the single read mailbox
    // consistent between them
    let config = SubDeviceConfig {
        sdo_configs: vec![
            SdoConfigItem {
                index: 0x8000,
                sub_index: 1,
                complete_access: false,
                data: vec![0x11, 0x22],
            },
            SdoConfigItem {
                index: 0x8000,
                sub_index: 2,
                complete_access: false,
                data: vec![0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
            },
        ],
        ..SubDeviceConfig::default()
    };

    engine.attach_config(0, config).unwrap();
    engine.request_state(0, SubDeviceState::SafeOp).unwrap();

    let handle = engine
        .submit_request(0, SdoRequest::upload(0x6000, 1), Instant::ZERO)
        .unwrap();

    util::run(&mut engine, &mut sim, 1000);

    // Both lanes completed their work against the one mailbox
    assert_eq!(
        engine.subdevice(0).unwrap().current_state(),
        SubDeviceState::SafeOp
    );

    let request = engine.take_request(handle).expect("request done");

    assert_eq!(request.state(), SdoRequestState::Success);
    assert_eq!(request.data(), &[1, 2, 3, 4]);

    assert_eq!(
        sim.devices[0].dictionary.get(&(0x8000, 1)),
        Some(&vec![0x11, 0x22])
    );
    assert_eq!(
        sim.devices[0].dictionary.get(&(0x8000, 2)),
        Some(&vec![0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
    );

    // Every fetch was preceded by a poll under the lock; nothing was fetched blind
    assert!(sim.devices[0].polls >= sim.devices[0].fetches);
}

#[test]
fn issue_timeout_expires_queued_requests() {
    let (mut engine, mut sim) = scanned_pair();

    // Park the device in INIT so the request lane never serves the queue
    engine.attach_config(0, SubDeviceConfig::default()).unwrap();
    engine.request_state(0, SubDeviceState::Init).unwrap();

    util::run(&mut engine, &mut sim, 200);

    let handle = engine
        .submit_request(
            0,
            SdoRequest::upload(0x6000, 1)
                .with_issue_timeout(core::time::Duration::from_millis(50)),
            Instant::ZERO,
        )
        .unwrap();

    util::run(&mut engine, &mut sim, 200);

    let request = engine.take_request(handle).expect("request expired");

    assert_eq!(request.state(), SdoRequestState::Failure);
}
