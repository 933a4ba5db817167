use assert_unordered::assert_eq_unordered;
use fdlproc::layout::{LayoutKind, PhaseWrap, RecordLayout, UnitScale};
use fdlproc::error::FdlError;
use fdlproc::parsing::error::ParseError;
use fdlproc::parsing::handle::{AbortReason, ParseHandle, ParseState};
use fdlproc::parsing::parser::{FramedStreamParser, ParseControl, Termination};
use fdlproc::parsing::session::CaptureSession;
use fdlproc::parsing::stream::SampleStream;
use fdlproc::signals::calibration::{NeutralCalibration, StaticCalibration};
use fdlproc::signals::catalog::{FitKind, SignalCatalog};
use fdlproc::signals::derivation::SignalDerivationEngine;
use fdlproc::signals::error::{DerivationError, DerivationStage};
use fdlproc::utils::constants::SENTINEL;
use fdlproc::SignalSet;
use is_close::is_close;
use std::fs;
use std::path::PathBuf;

/// Distinct for every slot of the first 300 records, never the separator.
fn raw_value(record: usize, offset: usize) -> i16 {
    ((record * 100 + offset) % 30_000) as i16
}

fn records(width: usize, count: usize) -> Vec<Vec<i16>> {
    (0..count)
        .map(|r| {
            let mut record = vec![SENTINEL];
            record.extend((1..width).map(|offset| raw_value(r, offset)));
            record
        })
        .collect()
}

fn write_capture(name: &str, samples: &[i16]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{}_fdlproc_{}.dat", name, std::process::id()));
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
    fs::write(&path, bytes).unwrap();
    path
}

fn identity_layout(names: &[&str]) -> RecordLayout {
    names
        .iter()
        .fold(RecordLayout::builder(), |builder, name| builder.slot(name))
        .scale(UnitScale {
            full_scale: 1.0,
            unit: 1.0,
        })
        .build()
        .unwrap()
}

fn signal_set(channels: &[(&str, Vec<f64>)]) -> SignalSet {
    channels
        .iter()
        .map(|(name, values)| (name.to_string(), values.clone()))
        .collect()
}

#[test]
fn well_formed_stream_round_trips() {
    let layout = RecordLayout::loops();
    let samples: Vec<i16> = records(layout.width(), 50).concat();
    let outcome = FramedStreamParser::new(layout.clone())
        .parse(&samples, &ParseControl::new())
        .unwrap();
    assert_eq!(outcome.complete_records, 50);
    assert!(outcome.anomalies.is_empty());
    assert_eq!(outcome.termination, Termination::EndOfFile);
    assert_eq!(outcome.channels.len(), 31);
    let scale = layout.scale();
    for (offset, name, _) in layout.named_slots() {
        let channel = &outcome.channels[name];
        assert_eq!(channel.len(), 50);
        for (r, value) in channel.iter().enumerate() {
            assert!(is_close!(*value, scale.apply(raw_value(r, offset))));
        }
    }
}

#[test]
fn inserted_sample_discards_one_record() {
    let layout = RecordLayout::diagnostics();
    let width = layout.width();
    let mut parts = records(width, 20);
    parts[7].push(29_999);
    let samples = parts.concat();
    let outcome = FramedStreamParser::new(layout.clone())
        .parse(&samples, &ParseControl::new())
        .unwrap();
    assert_eq!(outcome.complete_records, 19);
    assert_eq!(outcome.anomalies, vec![width + 1]);
    assert!(is_close!(outcome.anomaly_rate(), 1.0 / 20.0));
    let scale = layout.scale();
    let corrupted: Vec<f64> = (1..width)
        .map(|offset| scale.apply(raw_value(7, offset)))
        .chain([scale.apply(29_999)])
        .collect();
    for (name, channel) in outcome.channels.iter() {
        assert!(
            channel.iter().all(|v| !corrupted.contains(v)),
            "{name} holds a value of the corrupted record"
        );
    }
    // Record 8 follows the corrupted one and is intact
    assert!(is_close!(
        outcome.channels["SSA1Input_I"][7],
        scale.apply(raw_value(8, 2))
    ));
}

#[test]
fn deleted_sample_discards_one_record() {
    let layout = RecordLayout::diagnostics();
    let width = layout.width();
    let mut parts = records(width, 20);
    parts[3].pop();
    let outcome = FramedStreamParser::new(layout)
        .parse(&parts.concat(), &ParseControl::new())
        .unwrap();
    assert_eq!(outcome.complete_records, 19);
    assert_eq!(outcome.anomalies, vec![width - 1]);
}

#[test]
fn lost_separator_discards_two_records() {
    let layout = RecordLayout::loops();
    let width = layout.width();
    let mut parts = records(width, 10);
    parts[5][0] = 0;
    let outcome = FramedStreamParser::new(layout)
        .parse(&parts.concat(), &ParseControl::new())
        .unwrap();
    assert_eq!(outcome.complete_records, 8);
    assert_eq!(outcome.anomalies, vec![2 * width]);
    assert!(outcome
        .channels
        .values()
        .all(|channel| channel.len() == 8));
}

#[test]
fn stream_without_separator_fails() {
    let samples: Vec<i16> = (0..100).collect();
    let result = FramedStreamParser::new(RecordLayout::loops())
        .parse(&samples, &ParseControl::new());
    assert!(matches!(result, Err(ParseError::NoSentinelFound(100))));
}

#[test]
fn capture_file_is_parsed_in_background() {
    let width = RecordLayout::loops().width();
    let path = write_capture("Loops", &records(width, 12).concat());

    let kind = LayoutKind::from_path(&path).unwrap();
    assert_eq!(kind, LayoutKind::Loops);
    let mut handle = ParseHandle::start_parse(&path, kind).unwrap();
    assert_eq!(handle.wait(), ParseState::Done);
    let channels = handle.channels().unwrap();
    assert_eq!(channels["Cav_I"].len(), 12);
    assert_eq!(handle.progress().complete_records, 12);
    fs::remove_file(&path).unwrap();
}

#[test]
fn catalog_phase_alias_wraps_file_channel() {
    let layout = RecordLayout::diagnostics();
    let load_q = layout.slot_index("RvLoad_Q").unwrap();
    let mut parts = records(layout.width(), 5);
    for record in parts.iter_mut() {
        record[load_q] = 20_000;
    }
    let path = write_capture("Diag_phase", &parts.concat());
    let catalog = SignalCatalog::builder()
        .phase_alias("LoadPhase", "RvLoad_Q", PhaseWrap::default())
        .alias("LoadI", "RvLoad_I")
        .build()
        .unwrap();

    let mut session = CaptureSession::start(None, Some(path.clone()), &catalog).unwrap();
    assert_eq!(session.wait(), ParseState::Done);
    let engine = SignalDerivationEngine::new(catalog);
    let signals = session
        .derive(&engine, &NeutralCalibration)
        .unwrap()
        .into_signals()
        .unwrap();
    fs::remove_file(&path).unwrap();

    let unwrapped = UnitScale::default().apply(20_000);
    assert!(unwrapped > 512.0);
    assert_eq!(signals["LoadPhase"].len(), 5);
    for value in signals["LoadPhase"].iter() {
        assert!(is_close!(*value, unwrapped - 1024.0));
    }
    assert!(is_close!(
        signals["LoadI"][0],
        UnitScale::default().apply(raw_value(0, load_q - 1))
    ));
}

#[test]
fn files_are_processed_with_saved_parameters() {
    let width = RecordLayout::loops().width();
    let loops = write_capture("Loops_process", &records(width, 30).concat());
    let parameters = std::env::temp_dir().join(format!("fdlproc_{}.dllfdl", std::process::id()));
    fs::write(
        &parameters,
        "ShuntImpedance:3.3e8\nCavVolt_mV/m:2.0\nCavVolt_mV/n:0.0\n",
    )
    .unwrap();

    let derivation = fdlproc::process_files(Some(loops.clone()), None, Some(parameters.clone()));
    fs::remove_file(&loops).unwrap();
    fs::remove_file(&parameters).unwrap();
    let derivation = derivation.unwrap();

    assert!(!derivation.is_stalled());
    assert!(derivation.orphans.contains(&"SSA1Input".to_string()));
    assert!(!derivation.defaulted.contains(&"CavVolt_mV".to_string()));
    assert!(derivation.defaulted.contains(&"CavVolt_kV".to_string()));
    let amplitude = &derivation.signals["CavVolt"];
    let calibrated = &derivation.signals["CavVolt_mV"];
    assert_eq!(calibrated.len(), 30);
    for (a, c) in amplitude.iter().zip(calibrated) {
        assert!(is_close!(*c, *a / 2.0));
    }
}

#[test]
fn missing_parameter_file_is_reported() {
    let result = fdlproc::process_files(
        None,
        None,
        Some(PathBuf::from("/nonexistent/fdlproc.dllfdl")),
    );
    assert!(matches!(result, Err(FdlError::Calibration(_))));
}

#[test]
fn amplitude_of_parsed_channels() {
    let layout = identity_layout(&["Cav_I", "Cav_Q"]);
    let samples = vec![SENTINEL, 3, 4, SENTINEL, 6, 8];
    let raw = FramedStreamParser::new(layout)
        .parse(&samples, &ParseControl::new())
        .unwrap()
        .channels;
    let catalog = SignalCatalog::builder()
        .alias("CavVolt_I", "Cav_I")
        .alias("CavVolt_Q", "Cav_Q")
        .amplitude("CavVolt", "CavVolt_I", "CavVolt_Q")
        .build()
        .unwrap();
    let signals = SignalDerivationEngine::new(catalog)
        .derive(&raw, &NeutralCalibration)
        .unwrap();
    assert!(is_close!(signals["CavVolt"][0], 5.0));
    assert!(is_close!(signals["CavVolt"][1], 10.0));
}

#[test]
fn linear_fit_with_calibration() {
    let catalog = SignalCatalog::builder()
        .fit("CavVolt_kV", "CavVolt", FitKind::linear("CAV_VOLT_KV_m", "CAV_VOLT_KV_n"))
        .build()
        .unwrap();
    let calibration = StaticCalibration::new().with("CavVolt_kV", 2.0, 4.0);
    let signals = SignalDerivationEngine::new(catalog)
        .derive(&signal_set(&[("CavVolt", vec![10.0])]), &calibration)
        .unwrap();
    assert!(is_close!(signals["CavVolt_kV"][0], 3.0));
}

fn plant_channels() -> SignalSet {
    let mut set = signal_set(&[
        ("Cav_I", vec![3000.0, 2500.0, 4000.0]),
        ("Cav_Q", vec![4000.0, 1000.0, 3000.0]),
        ("FwCav_I", vec![900.0, 1200.0, 700.0]),
        ("FwCav_Q", vec![100.0, -300.0, 200.0]),
        ("RvCav_I", vec![20.0, 30.0, 10.0]),
        ("RvCav_Q", vec![-10.0, 5.0, 0.0]),
    ]);
    for pair in ["Control", "Error", "ErroAccum", "SSA1Input"] {
        set.insert(format!("{pair}_I"), vec![1.0, 2.0, 3.0]);
        set.insert(format!("{pair}_Q"), vec![-1.0, 0.5, 0.0]);
    }
    set
}

#[test]
fn declaration_order_does_not_matter() {
    let catalog = SignalCatalog::default_catalog().unwrap();
    let entries: Vec<_> = catalog
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect();
    let reversed = entries
        .iter()
        .rev()
        .fold(SignalCatalog::builder(), |builder, (name, spec)| {
            builder.signal(name, spec.clone())
        })
        .build()
        .unwrap();
    let rotated = entries
        .iter()
        .cycle()
        .skip(entries.len() / 2)
        .take(entries.len())
        .fold(SignalCatalog::builder(), |builder, (name, spec)| {
            builder.signal(name, spec.clone())
        })
        .build()
        .unwrap();

    let raw = plant_channels();
    let calibration = StaticCalibration::new()
        .with("CavVolt_mV", 2.0, 100.0)
        .with("CavVolt_kV", 0.5, 0.0)
        .with("FwCav_kW", 1.0, 0.0)
        .with_beam_current(150.0);
    let expected = SignalDerivationEngine::new(catalog)
        .derive(&raw, &calibration)
        .unwrap();
    assert!(expected.contains_key("BeamPhase"));
    for permuted in [reversed, rotated] {
        let signals = SignalDerivationEngine::new(permuted)
            .derive(&raw, &calibration)
            .unwrap();
        assert_eq_unordered!(
            signals.keys().collect::<Vec<_>>(),
            expected.keys().collect::<Vec<_>>()
        );
        for (name, values) in expected.iter() {
            assert_eq!(&signals[name.as_str()], values, "{name} differs");
        }
    }
}

#[test]
fn broken_formula_stalls_alone() {
    let catalog = SignalCatalog::builder()
        .alias("CavVolt_I", "Cav_I")
        .alias("CavVolt_Q", "Cav_Q")
        .amplitude("CavVolt", "CavVolt_I", "CavVolt_Q")
        .fit("CavVolt_kV", "CavVolt", FitKind::linear("m", "n"))
        .formula("Double", "CavVolt_kV * 2", &["CavVolt_kV"])
        .formula("Broken", "CavVolt_kV * Ghost", &["CavVolt_kV", "Ghost"])
        .build()
        .unwrap();
    let engine = SignalDerivationEngine::new(catalog);
    let raw = signal_set(&[("Cav_I", vec![3.0]), ("Cav_Q", vec![4.0])]);

    assert_eq!(
        engine.derive(&raw, &NeutralCalibration),
        Err(DerivationError::Stalled {
            stage: DerivationStage::Formula,
            unresolved: vec!["Broken".to_string()],
        })
    );
    let derivation = engine.derive_report(&raw, &NeutralCalibration);
    assert!(is_close!(derivation.signals["CavVolt_kV"][0], 5.0));
    assert!(is_close!(derivation.signals["Double"][0], 10.0));
    assert!(!derivation.signals.contains_key("Broken"));
    assert!(derivation.orphans.is_empty());
}

#[test]
fn cancelled_parse_keeps_aligned_channels() {
    let layout = RecordLayout::loops();
    let samples = records(layout.width(), 100).concat();
    let mut handle = ParseHandle::from_stream("Loops", SampleStream::new(samples), layout);
    handle.cancel();
    handle.start().unwrap();
    assert_eq!(handle.wait(), ParseState::Aborted);
    assert_eq!(handle.abort_reason(), Some(AbortReason::Cancelled));
    assert!(matches!(handle.channels(), Err(ParseError::NotReady(_))));
    let outcome = handle.into_outcome(true).unwrap();
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(outcome
        .channels
        .values()
        .all(|channel| channel.len() == outcome.complete_records));
}

#[test]
fn cancel_lands_between_records() {
    let layout = RecordLayout::loops();
    let total = 100;
    let samples = records(layout.width(), total).concat();
    let mut handle = ParseHandle::from_stream("Loops", SampleStream::new(samples), layout);
    handle.cancel_after(37);
    handle.start().unwrap();
    assert_eq!(handle.wait(), ParseState::Aborted);
    assert_eq!(handle.abort_reason(), Some(AbortReason::Cancelled));
    let progress = handle.progress();
    assert!(progress.percent > 0 && progress.percent < 100);
    let outcome = handle.into_outcome(true).unwrap();
    assert!(outcome.complete_records > 0 && outcome.complete_records < total);
    assert_eq!(outcome.complete_records, 37);
    assert!(outcome
        .channels
        .values()
        .all(|channel| channel.len() == outcome.complete_records));
    let scale = UnitScale::default();
    assert!(is_close!(
        outcome.channels["Cav_I"][36],
        scale.apply(raw_value(36, 18))
    ));
}

#[test]
fn cancellation_races_with_parse() {
    let layout = RecordLayout::loops();
    let total = 200_000;
    let samples = records(layout.width(), total).concat();
    let mut handle = ParseHandle::from_stream("Loops", SampleStream::new(samples), layout);
    handle.start().unwrap();
    while handle.progress().complete_records == 0 && handle.state() == ParseState::Running {
        std::thread::yield_now();
    }
    handle.cancel();
    let state = handle.wait();
    let outcome = handle.into_outcome(true).unwrap();
    if state == ParseState::Aborted {
        assert!(outcome.complete_records > 0 && outcome.complete_records < total);
    } else {
        assert_eq!(outcome.complete_records, total);
    }
    assert!(outcome
        .channels
        .values()
        .all(|channel| channel.len() == outcome.complete_records));
}

#[test]
fn session_refuses_partial_captures_unless_asked() {
    let engine = SignalDerivationEngine::new(SignalCatalog::default_catalog().unwrap());
    let cancelled = || {
        let layout = RecordLayout::diagnostics();
        let samples = records(layout.width(), 10).concat();
        let mut handle = ParseHandle::from_stream("Diag", SampleStream::new(samples), layout);
        handle.cancel();
        handle.start().unwrap();
        CaptureSession::new().with_diagnostics(handle)
    };

    assert!(matches!(
        cancelled().derive(&engine, &NeutralCalibration),
        Err(ParseError::NotReady(_))
    ));
    let derivation = cancelled()
        .derive_partial(&engine, &NeutralCalibration)
        .unwrap();
    assert!(derivation.orphans.contains(&"CavVolt".to_string()));
    assert!(derivation.signals.contains_key("SSA1Input"));
}
