//! `initFFMPEG` / `playAudio` / `uninitFFMPEG` driven the way a C caller would.

#![cfg(feature = "abi-handle")]
#![allow(unsafe_code, clippy::unwrap_used)]

mod common;

use std::ffi::CString;
use std::ptr;

use common::sine_wav;
use compskyplayaudio::ffi::{initFFMPEG, playAudio, uninitFFMPEG};
use compskyplayaudio::{EngineEvent, Session};

fn headless() {
    std::env::set_var("PLAYAUDIO_OUTPUT", "discard");
}

fn drain_events(session: *const Session) -> Vec<EngineEvent> {
    let engine = unsafe { &*session }.engine();
    std::iter::from_fn(|| engine.try_recv_event()).collect()
}

fn finished(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| **e == EngineEvent::PlaybackFinished)
        .count()
}

fn errors(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Error(_)))
        .count()
}

#[test]
fn init_play_uninit() {
    headless();
    let file = sine_wav(44100, 2, 4410);
    let path = CString::new(file.0.to_str().unwrap()).unwrap();

    let session = initFFMPEG();
    assert!(!session.is_null());

    unsafe { playAudio(session, path.as_ptr(), 0.0, 0.0, 1.0) };
    let events = drain_events(session);
    assert_eq!(finished(&events), 1);
    assert_eq!(errors(&events), 0);
    assert!(events.contains(&EngineEvent::TrackLoaded));

    // Out-of-range and non-finite parameters are tolerated.
    unsafe { playAudio(session, path.as_ptr(), -7.0, f32::NAN, 100.0) };
    assert_eq!(finished(&drain_events(session)), 1);

    unsafe { uninitFFMPEG(session) };
}

#[test]
fn bad_arguments_are_logged_not_fatal() {
    headless();
    let missing = CString::new("/nonexistent/track.flac").unwrap();
    let file = sine_wav(48000, 2, 480);
    let good = CString::new(file.0.to_str().unwrap()).unwrap();

    let session = initFFMPEG();
    assert!(!session.is_null());

    // A null session is ignored before anything reaches an engine.
    unsafe { playAudio(ptr::null(), good.as_ptr(), 0.0, 0.0, 1.0) };

    // A null path never reaches the engine.
    unsafe { playAudio(session, ptr::null(), 0.0, 0.0, 1.0) };
    assert!(drain_events(session).is_empty());

    unsafe { playAudio(session, missing.as_ptr(), 0.0, 0.0, 1.0) };
    let events = drain_events(session);
    assert_eq!(errors(&events), 1);
    assert_eq!(finished(&events), 0);

    // The session is still usable afterwards.
    unsafe { playAudio(session, good.as_ptr(), 0.0, 0.0, 1.0) };
    assert_eq!(finished(&drain_events(session)), 1);

    unsafe {
        uninitFFMPEG(session);
        uninitFFMPEG(ptr::null_mut());
    }
}

#[test]
fn sessions_are_independent() {
    headless();
    let file = sine_wav(48000, 1, 960);
    let path = CString::new(file.0.to_str().unwrap()).unwrap();

    let first = initFFMPEG();
    let second = initFFMPEG();
    assert!(!first.is_null() && !second.is_null());

    unsafe { uninitFFMPEG(first) };

    unsafe { playAudio(second, path.as_ptr(), 0.5, 0.3, 0.8) };
    assert_eq!(finished(&drain_events(second)), 1);

    unsafe { uninitFFMPEG(second) };
}
