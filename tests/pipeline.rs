use std::path::Path;

use bic_calib::aggregator::CellKey;
use bic_calib::calibration_table::CalibrationTable;
use bic_calib::channel_map::Side;
use bic_calib::event::Event;
use bic_calib::event_file::write_events;
use bic_calib::histogram::Histogram;
use bic_calib::pipeline;
use bic_calib::qa::JsonQaReport;
use bic_calib::simulation::{JsonHistogramStore, histogram_name};
use bic_calib::{CalibConfig, CalibError};

// (MID, CH, ADC height); the height lands on two ADC samples of the fixed window
fn event(hits: &[(u32, u32, i32)], trigger_time: i64) -> Event {
    let mut samples = vec![0; 200 * hits.len()];
    let mut offsets = vec![];
    for (i, &(_, _, height)) in hits.iter().enumerate() {
        let base = i * 200;
        offsets.push(Some(base as i64));
        samples[base + 100] = height;
        samples[base + 101] = 7;
        samples[base + 102] = height;
        samples[base + 103] = 7;
    }
    Event {
        module_ids: hits.iter().map(|h| h.0).collect(),
        channels: hits.iter().map(|h| h.1).collect(),
        waveform_offsets: offsets,
        samples,
        channel_count: 92,
        trigger_time: Some(trigger_time),
        trigger_number: Some(1),
        ..Default::default()
    }
}

fn run_events() -> Vec<Event> {
    // layer 1: (41,7)/(41,23) are GeomID 13 R/L, (42,6)/(42,22) are GeomID 10 R/L
    // (41,3) sits in layer 0, (40,1) is on a board that is not read out
    let mut events = vec![];
    for i in 0..20 {
        let h = 1000 + 50 * (i % 5);
        events.push(event(
            &[(41, 7, h), (41, 23, h + 100), (42, 6, h / 2), (42, 22, h / 2), (41, 3, 300), (40, 1, 999)],
            i as i64 * 10,
        ));
    }
    let mut incomplete = event(&[(41, 7, 20_000)], 5);
    incomplete.channel_count = 60;
    events.push(incomplete);
    events
}

fn write_simulation(path: &Path) {
    let store: JsonHistogramStore = [(13, 395.0), (10, 205.0), (5, 95.0)]
        .into_iter()
        .map(|(geom_id, deposit)| {
            let mut h = Histogram::new(&histogram_name("Edep", geom_id), 100, (0.0, 1000.0));
            h.fill(deposit);
            h
        })
        .collect();
    store.write(path).unwrap();
}

#[test]
fn test_calibrate_then_apply() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Run_60184_Waveform.parquet");
    let simulation = dir.path().join("sim.json");
    write_events(&run_events(), &input).unwrap();
    write_simulation(&simulation);

    let config = CalibConfig::default();
    let calibrate_dir = dir.path().join("calibration_constant_output");
    let outcome = pipeline::calibrate(&config, &input, &simulation, &calibrate_dir).unwrap();

    assert!(outcome.table_path.ends_with("calibration_bic_output_Run60184_layer1.parquet"));
    assert!(outcome.text_path.exists());
    assert!(outcome.qa_path.exists());
    assert_eq!(outcome.aggregation.summary.events_incomplete, 1);
    assert_eq!(outcome.aggregation.summary.events_accepted, 20);

    let table = CalibrationTable::load(&outcome.table_path).unwrap();
    assert_eq!(table.len(), 4);
    assert_eq!(table, outcome.solution.table);
    assert_eq!(table, CalibrationTable::load(&outcome.text_path).unwrap());
    // data mean of GeomID 13 R is 2 * 1100
    let constant = table.constant(13, Side::Right).unwrap();
    assert!((constant - 197.5 / 2200.0).abs() < 1e-12);

    let apply_dir = dir.path().join("energy_calibration_output");
    let applied = pipeline::apply(&config, &input, &[outcome.table_path.clone()], Some(&simulation), &apply_dir).unwrap();
    let run = &applied.run;
    for (geom_id, side, expected) in [
        (13, Side::Right, 197.5),
        (13, Side::Left, 197.5),
        (10, Side::Right, 102.5),
        (10, Side::Left, 102.5),
    ] {
        let acc = run.aggregation.cells.get(&CellKey::new(geom_id, side)).unwrap();
        assert!((acc.mean() - expected).abs() < 1e-9, "GeomID {geom_id} {side:?}");
    }
    // layer 0 has no constants and passes through at unity: 2 * 300
    let layer0 = run.aggregation.cells.get(&CellKey::new(8, Side::Left)).unwrap();
    assert!((layer0.mean() - 600.0).abs() < 1e-9);
    assert_eq!(run.aggregation.summary.channels_uncalibrated, 20);
    assert_eq!(run.events.len(), 20);
    assert!(applied.events_path.exists());
    assert!(run.beam_scale.is_none());

    let report = JsonQaReport::read(&applied.qa_path).unwrap();
    assert!(report.histograms.contains_key("hCal_G13"));
    assert!(report.histograms.contains_key("hTotalCal"));
    assert!(report.notes.iter().any(|n| n.contains("MID 41 CH 3")));
}

#[test]
fn test_apply_with_beam_normalization() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("beam_Waveform.parquet");
    let simulation = dir.path().join("sim.json");
    write_events(&run_events(), &input).unwrap();
    write_simulation(&simulation);

    let config = CalibConfig {
        beam_normalization: true,
        ..Default::default()
    };
    let outcome = pipeline::calibrate(&config, &input, &simulation, dir.path()).unwrap();
    let applied = pipeline::apply(&config, &input, &[outcome.table_path.clone()], Some(&simulation), dir.path()).unwrap();

    // layer 1 holds GeomID 10 and 13 in the simulation
    let scale = applied.run.beam_scale.unwrap();
    assert!((scale - 3000.0 / 600.0).abs() < 1e-9);
    assert_eq!(applied.run.scaled_total.as_ref().unwrap().integral(), 20);
    assert!(applied.events_path.ends_with("energy_calibrated_beam.parquet"));
}

#[test]
fn test_parallel_calibration_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Run_1_Waveform.parquet");
    let simulation = dir.path().join("sim.json");
    write_events(&run_events(), &input).unwrap();
    write_simulation(&simulation);

    let sequential = pipeline::calibrate(&CalibConfig::default(), &input, &simulation, &dir.path().join("seq")).unwrap();
    let config = CalibConfig {
        parallel: true,
        ..Default::default()
    };
    let parallel = pipeline::calibrate(&config, &input, &simulation, &dir.path().join("par")).unwrap();
    assert_eq!(sequential.aggregation.summary, parallel.aggregation.summary);
    for (a, b) in sequential.solution.table.iter().zip(parallel.solution.table.iter()) {
        assert_eq!(a.key(), b.key());
        assert!((a.constant - b.constant).abs() < 1e-12);
    }
}

#[test]
fn test_qa_and_selection() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Run_42_Waveform.parquet");
    write_events(&run_events(), &input).unwrap();

    let config = CalibConfig::default();
    let report_path = pipeline::integrated_adc_qa(&config, &input, dir.path()).unwrap();
    assert!(report_path.ends_with("intADC_QA_Run42_layer1.json"));
    let report = JsonQaReport::read(&report_path).unwrap();
    assert!(report.histograms.contains_key("hIntADC_G13_R"));
    assert_eq!(report.values["summary.events_incomplete"], 1.0);

    let mut config = CalibConfig::default();
    config.selection.time_max = 95;
    let output = dir.path().join("Run_42_Selected.parquet");
    // trigger times 0..=90 and the incomplete event at 5
    assert_eq!(pipeline::select(&config, &input, &output).unwrap(), 11);
}

#[test]
fn test_failed_write_leaves_no_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Run_7_Waveform.parquet");
    let simulation = dir.path().join("sim.json");
    write_events(&run_events(), &input).unwrap();
    write_simulation(&simulation);

    let out = dir.path().join("out");
    // a directory in the way of the text table makes the second write fail
    std::fs::create_dir_all(out.join("calibration_constants_Run7_layer1.txt.partial")).unwrap();
    let result = pipeline::calibrate(&CalibConfig::default(), &input, &simulation, &out);
    assert!(matches!(result, Err(CalibError::File(_))));

    let names: Vec<String> = std::fs::read_dir(&out)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["calibration_constants_Run7_layer1.txt.partial".to_owned()]);
}

#[test]
fn test_missing_inputs_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let config = CalibConfig::default();
    let result = pipeline::calibrate(
        &config,
        &dir.path().join("missing.parquet"),
        &dir.path().join("missing.json"),
        dir.path(),
    );
    assert!(matches!(result, Err(CalibError::File(_))));

    let result = pipeline::apply(&config, &dir.path().join("missing.parquet"), &[], None, dir.path());
    assert!(matches!(result, Err(CalibError::Config(_))));
}
