//! End-to-end bus scenarios: full transactions from break detection to the
//! transmitted response, driven through the simulated line and timer.

mod common;

use common::BusHarness;
use sdi12_bridge::consts::{BREAK_RETEST_US, SRQ_TICK_US};
use sdi12_bridge::crc::{crc16_arc, decode_ascii};
use sdi12_bridge::line::{CharErrors, Level};
use sdi12_bridge::{DataMsg, State};

fn soil_report() -> DataMsg {
    let mut msg = DataMsg::new();
    msg.push_byte(b'+');
    msg.push_u16(512);
    msg.push_byte(b'+');
    msg.push_u16(498);
    msg
}

/// Runs a measure command to the acknowledged state, leaving the driver
/// waiting on wireless data.
fn measured(h: &mut BusHarness, cmd: &[u8], expect_ack: &[u8]) {
    h.wake(15_000, 9_000);
    h.send_cmd(cmd);
    assert_eq!(h.collect_response(), expect_ack);
    assert_eq!(h.drv.state(), State::WaitSrq);
}

#[test]
fn measure_ack_and_data_signal() {
    // break + mark + 0M! answers the timing frame after the response mark
    // and raises the wireless data request
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"0M!");
    assert_eq!(h.collect_response(), b"00012\r\n");
    assert_eq!(h.drv.take_data_request(), Some(0));
    assert_eq!(h.drv.state(), State::WaitSrq);
}

#[test]
fn data_after_service_request_without_break() {
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    assert_eq!(h.drv.take_data_request(), Some(0));

    // wireless data lands 700 ms into the window
    h.advance(700_000);
    assert!(h.drv.supply_data(soil_report()));

    // the next tick sends the unsolicited service request
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");
    assert_eq!(h.drv.state(), State::WaitDBrk);

    // the host answers inside the 85 ms window, no break needed
    h.send_no_break_command(b"0D0!");
    assert_eq!(h.collect_response(), b"0+512+498\r\n");
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.flags().is_empty());
}

#[test]
fn data_with_crc_request() {
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0MC!", b"00012\r\n");
    h.advance(700_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    h.send_no_break_command(b"0D0!");
    let resp = h.collect_response();
    assert_eq!(&resp[..9], b"0+512+498");
    assert_eq!(&resp[12..], b"\r\n");
    let crc = decode_ascii([resp[9], resp[10], resp[11]]).unwrap();
    assert_eq!(crc, crc16_arc(b"0+512+498"));
}

#[test]
fn data_after_service_request_with_fresh_break() {
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    h.advance(300_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    // a full break inside the window re-enters the normal receive path
    h.edge(Level::Low, 20_000);
    assert_eq!(h.drv.state(), State::DTst);
    h.edge(Level::High, 15_000);
    assert_eq!(h.drv.state(), State::TstMrk);
    h.advance(9_000);
    h.send_cmd(b"0D0!");
    assert_eq!(h.collect_response(), b"0+512+498\r\n");
}

#[test]
fn expired_no_break_window_requires_break() {
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    h.advance(300_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    // let the 85 ms window lapse, then break normally
    h.advance(85_000);
    assert_eq!(h.drv.state(), State::WaitDBrk2);
    h.edge(Level::Low, 10_000);
    assert_eq!(h.drv.state(), State::DBrk);
    h.edge(Level::High, 15_000);
    h.advance(9_000);
    h.send_cmd(b"0D0!");
    assert_eq!(h.collect_response(), b"0+512+498\r\n");
}

#[test]
fn query_rotates_addresses() {
    let mut h = BusHarness::new(&[0, 3, 7], 1);
    for expect in [b"0\r\n", b"3\r\n", b"7\r\n", b"0\r\n"] {
        h.wake(15_000, 9_000);
        h.send_cmd(b"?!");
        assert_eq!(h.collect_response(), expect);
        assert_eq!(h.drv.state(), State::Idle);
    }
}

#[test]
fn srq_window_expiry_discards_late_data() {
    let mut h = BusHarness::new(&[7], 1);
    measured(&mut h, b"7M!", b"70012\r\n");

    // nothing produced within the 1 s window
    h.advance(2_000_000);
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.flags().is_empty());

    // late data is dropped on the floor
    assert!(!h.drv.supply_data(soil_report()));

    // a subsequent data request answers data-unavailable
    h.wake(15_000, 9_000);
    h.send_cmd(b"7D0!");
    assert_eq!(h.collect_response(), b"70000\r\n");
}

#[test]
fn srq_boundary_timing() {
    // with a one-second wait, data at 800 ms is serviced
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    h.advance(800_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    // data at 1200 ms is past the window and discarded
    let mut h = BusHarness::new(&[0], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    h.advance(1_200_000);
    assert_eq!(h.drv.state(), State::Idle);
    assert!(!h.drv.supply_data(soil_report()));
}

#[test]
fn abort_break_during_srq_wait() {
    let mut h = BusHarness::new(&[5], 2);
    measured(&mut h, b"5M!", b"50022\r\n");
    assert_eq!(h.drv.take_data_request(), Some(5));

    // the host aborts with a >12 ms break instead of waiting
    h.edge(Level::Low, 300_000);
    assert_eq!(h.drv.state(), State::ABrk);
    h.edge(Level::High, 15_000);
    h.drv.do_task();
    h.advance(10_000);
    assert_eq!(h.collect_response(), b"5\r\n");
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.flags().is_empty());

    // the aborted measurement no longer accepts data
    assert!(!h.drv.supply_data(soil_report()));
}

#[test]
fn abort_break_too_short_is_noise() {
    let mut h = BusHarness::new(&[5], 1);
    measured(&mut h, b"5M!", b"50012\r\n");
    h.edge(Level::Low, 150_000);
    h.edge(Level::High, 8_000);
    assert_eq!(h.drv.state(), State::Idle);
}

#[test]
fn break_boundary() {
    // 11.999 ms is not a break
    let mut h = BusHarness::new(&[0], 1);
    h.edge(Level::Low, 100);
    h.edge(Level::High, 11_999);
    assert_eq!(h.drv.state(), State::Idle);

    // 12.000 ms is
    let mut h = BusHarness::new(&[0], 1);
    h.edge(Level::Low, 100);
    h.edge(Level::High, 12_000);
    assert_eq!(h.drv.state(), State::TstMrk);
}

#[test]
fn mark_boundary() {
    // an edge at 8.189 ms restarts break detection
    let mut h = BusHarness::new(&[0], 1);
    h.edge(Level::Low, 100);
    h.edge(Level::High, 15_000);
    h.edge(Level::Low, 8_189);
    assert_eq!(h.drv.state(), State::TstBrk);

    // 8.191 ms of mark opens the command window
    let mut h = BusHarness::new(&[0], 1);
    h.edge(Level::Low, 100);
    h.edge(Level::High, 15_000);
    h.advance(8_191);
    assert_eq!(h.drv.state(), State::WaitAct);
    assert!(h.drv.line.rx_on);
}

#[test]
fn foreign_address_is_ignored() {
    let mut h = BusHarness::new(&[0, 3], 1);
    h.wake(15_000, 9_000);
    h.send_char(b'5');
    assert_eq!(h.drv.state(), State::Idle);

    // and nothing is ever transmitted
    h.advance(50_000);
    assert!(h.drv.line.take_tx().is_none());
}

#[test]
fn malformed_command_stays_silent() {
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"0Q!");
    assert_eq!(h.collect_response(), b"");
    assert_eq!(h.drv.state(), State::Idle);
    assert_eq!(h.drv.cmd_errors, 1);
}

#[test]
fn acknowledge_and_identity() {
    let mut h = BusHarness::new(&[4], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"4!");
    assert_eq!(h.collect_response(), b"4\r\n");

    h.wake(15_000, 9_000);
    h.send_cmd(b"4I!");
    let resp = h.collect_response();
    assert_eq!(resp[0], b'4');
    assert_eq!(resp.len(), 26);
    assert_eq!(&resp[24..], b"\r\n");
}

#[test]
fn framing_error_restarts_break_detection() {
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    assert_eq!(h.drv.state(), State::WaitAct);
    h.send_bad_char(
        0,
        CharErrors {
            framing: true,
            ..CharErrors::NONE
        },
    );
    assert_eq!(h.drv.state(), State::TstBrk);
    assert_eq!(h.drv.timer.deadline, Some(BREAK_RETEST_US));

    // other character errors re-test the mark instead
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_char(b'0');
    h.send_bad_char(
        b'M',
        CharErrors {
            parity: true,
            ..CharErrors::NONE
        },
    );
    assert_eq!(h.drv.state(), State::TstMrk);
}

#[test]
fn wait_timeouts_return_to_idle_clean() {
    // no character after break + mark
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.advance(100_000);
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.flags().is_empty());
    assert!(!h.drv.line.tx_on);
    assert!(h.drv.line.edge_int_on);

    // command stalls between characters
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_char(b'0');
    h.send_char(b'M');
    h.advance(12_000);
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.flags().is_empty());
}

#[test]
fn overlong_command_is_dropped() {
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    for c in b"0XAAAAAAAAAA" {
        h.send_char(*c);
    }
    assert_eq!(h.drv.state(), State::Idle);
}

#[test]
fn follow_on_filter_holds_measurement_conversation() {
    // after the SRQ, a fresh break followed by a different address kills
    // the conversation instead of answering
    let mut h = BusHarness::new(&[0, 3], 1);
    measured(&mut h, b"0M!", b"00012\r\n");
    h.advance(300_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    h.edge(Level::Low, 20_000);
    h.edge(Level::High, 15_000);
    h.advance(9_000);
    h.send_cmd(b"3D0!");
    assert_eq!(h.drv.state(), State::Idle);
    assert!(h.drv.line.take_tx().is_none());
}

#[test]
fn concurrent_command_context_survives_response() {
    let mut h = BusHarness::new(&[2], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"2C!");
    assert_eq!(h.collect_response(), b"200102\r\n");
    assert_eq!(h.drv.state(), State::Idle);

    // the concurrent context allows a later collect; with nothing staged it
    // answers data-unavailable
    h.wake(15_000, 9_000);
    h.send_cmd(b"2D0!");
    assert_eq!(h.collect_response(), b"20000\r\n");
    assert!(h.drv.flags().is_empty());
}

#[test]
fn measurement_response_spacing_is_one_character_hold() {
    // the first response byte goes out exactly at the response-mark
    // deadline, not before
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"0M!");
    assert_eq!(h.drv.state(), State::SndMrk);
    assert!(h.drv.line.take_tx().is_none());
    h.advance(8_449);
    assert!(h.drv.line.take_tx().is_none());
    h.advance(1);
    assert_eq!(h.drv.line.take_tx(), Some(b'0'));
    // finish the frame so the driver leaves the transmit state
    h.drv.on_tx_complete();
    let rest = h.drain_tx();
    assert_eq!(rest, b"0012\r\n");
}

#[test]
fn mn_and_dn_group_matching() {
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_cmd(b"0M3!");
    assert_eq!(h.collect_response(), b"00012\r\n");
    assert_eq!(h.drv.state(), State::WaitSrq);
    h.advance(300_000);
    assert!(h.drv.supply_data(soil_report()));
    h.advance(SRQ_TICK_US);
    assert_eq!(h.drain_tx(), b"0\r\n");

    // the wrong group number is a protocol error: silence
    h.send_no_break_command(b"0D1!");
    assert_eq!(h.collect_response(), b"");
    assert_eq!(h.drv.state(), State::Idle);
}

#[test]
fn unsolicited_chars_without_break_are_ignored() {
    let mut h = BusHarness::new(&[0], 1);
    // no break: the receiver is off, so nothing reaches the state machine
    h.send_char(b'0');
    h.send_char(b'M');
    assert_eq!(h.drv.state(), State::Idle);
}

#[test]
fn break_during_command_restarts_cleanly() {
    let mut h = BusHarness::new(&[0], 1);
    h.wake(15_000, 9_000);
    h.send_char(b'0');
    // the host re-breaks mid-command (seen as a framing error)
    h.send_bad_char(
        0,
        CharErrors {
            framing: true,
            ..CharErrors::NONE
        },
    );
    h.edge(Level::High, 14_000);
    h.advance(9_000);
    h.send_cmd(b"0!");
    assert_eq!(h.collect_response(), b"0\r\n");
}
