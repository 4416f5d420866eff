//! Readout through pre-fetched sequencer streams.

mod common;

use std::time::{Duration, Instant};

use common::{build, words};
use crate_readout::event_buffer::EventBuffer;
use crate_readout::mock::data_word;
use crate_readout::module::BARRIER_WORD;
use crate_readout::transport::{marker, SequencerPhase, DATA_MARKER, DT_MARKER};
use crate_readout::{CrateState, ReadoutCrate, ReadoutFail};

const LAYOUT: &str = "\
transport = \"sequencer\"
[[module]]
kind = \"mock\"
[[module]]
kind = \"barrier\"
[[module]]
kind = \"mock\"
[[module]]
kind = \"mock\"
skip_dt = true
event_max = 0
";

fn prepared() -> ReadoutCrate {
    let mut crate_ = build(LAYOUT);
    crate_.init().unwrap();
    crate_.tag_counter_increase(None, 1);
    crate_
}

fn dt_stream(counter: u32) -> Vec<u32> {
    vec![counter, marker(DT_MARKER, 0), counter, marker(DT_MARKER, 1)]
}

#[test]
fn test_program_lists_visited_modules() {
    let crate_ = build(LAYOUT);

    let dt = crate_.sequencer_program(SequencerPhase::Deadtime);
    assert_eq!(dt.iter().map(|s| s.module).collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(dt[0].words, vec![0x1000_0000]);
    assert_eq!(dt[1].marker, marker(DT_MARKER, 1));

    let data = crate_.sequencer_program(SequencerPhase::Data);
    assert_eq!(data.iter().map(|s| s.module).collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(data[1].words, vec![0x2000_0001]);
    assert_eq!(data[0].marker, marker(DATA_MARKER, 0));
}

#[test]
fn test_correct_markers_consume_streams_exactly() {
    let mut crate_ = prepared();

    let dt = dt_stream(1);
    crate_.stage_sequencer(SequencerPhase::Deadtime, &dt);
    assert!(crate_.readout_dt().unwrap().is_ok());
    assert_eq!(crate_.sequencer_consumed(SequencerPhase::Deadtime), dt.len());
    assert_eq!(crate_.state(), CrateState::Ready);

    let data = vec![
        1,
        data_word(0, 0),
        marker(DATA_MARKER, 0),
        1,
        data_word(1, 0),
        marker(DATA_MARKER, 1),
    ];
    crate_.stage_sequencer(SequencerPhase::Data, &data);
    let mut buf = [0u8; 64];
    let mut eb = EventBuffer::new(&mut buf);
    assert!(crate_.readout(&mut eb).is_ok());
    assert_eq!(crate_.sequencer_consumed(SequencerPhase::Data), data.len());
    assert_eq!(
        words(eb.filled()),
        vec![data_word(0, 0), BARRIER_WORD, data_word(1, 0)]
    );
    assert_eq!(crate_.state(), CrateState::Ready);
}

#[test]
fn test_bad_deadtime_marker_fails() {
    let mut crate_ = prepared();
    let mut dt = dt_stream(1);
    dt[3] = marker(DT_MARKER, 7);
    crate_.stage_sequencer(SequencerPhase::Deadtime, &dt);

    let result = crate_.readout_dt().unwrap();
    assert!(result.contains(ReadoutFail::ERROR_DRIVER));
    assert_eq!(crate_.state(), CrateState::Reinit);
}

#[test]
fn test_bad_data_marker_fails() {
    let mut crate_ = prepared();
    crate_.stage_sequencer(SequencerPhase::Deadtime, &dt_stream(1));
    assert!(crate_.readout_dt().unwrap().is_ok());

    let data = vec![1, data_word(0, 0), 0xdead_beef];
    crate_.stage_sequencer(SequencerPhase::Data, &data);
    let mut buf = [0u8; 64];
    let mut eb = EventBuffer::new(&mut buf);
    assert!(crate_.readout(&mut eb).contains(ReadoutFail::ERROR_DRIVER));
    assert_eq!(crate_.state(), CrateState::Reinit);
}

#[test]
fn test_stale_counter_is_not_repolled() {
    let mut crate_ = prepared();
    crate_.stage_sequencer(SequencerPhase::Deadtime, &dt_stream(0));

    let start = Instant::now();
    let result = crate_.readout_dt().unwrap();
    assert!(result.contains(ReadoutFail::EVENT_COUNTER_MISMATCH));
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_short_stream_is_missing_data() {
    let mut crate_ = prepared();
    crate_.stage_sequencer(SequencerPhase::Deadtime, &[]);
    assert!(crate_.readout_dt().unwrap().contains(ReadoutFail::DATA_MISSING));
}
