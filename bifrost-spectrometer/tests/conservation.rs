use approx::assert_relative_eq;
use bifrost_core::{DataArray, EventTable, Unit, Variable, EVENT_DIM};
use bifrost_spectrometer::normalization::NORMALIZATION_COORD;
use bifrost_spectrometer::{
    hist_events, merge_triplets, normalize_by_monitor_and_proton_charge, BinSpec,
    UncertaintyBroadcastMode, TRIPLET_DIM,
};

fn triplet(arc: i64, channel: i64, energies: &[f64]) -> DataArray {
    let mut events = EventTable::unit_weights((0..energies.len()).map(|i| i % 3).collect());
    events
        .insert_coord(
            "energy_transfer",
            Variable::floats_1d(EVENT_DIM, energies.to_vec(), Unit::MILLI_ELECTRON_VOLT),
        )
        .unwrap();
    let mut da = DataArray::binned(&["tube", "length"], &[3, 1], events, Unit::COUNTS).unwrap();
    da.insert_coord("arc", Variable::index(arc)).unwrap();
    da.insert_coord("channel", Variable::index(channel)).unwrap();
    da
}

#[test]
fn test_merging_and_histogramming_conserve_counts() {
    let triplets = vec![
        triplet(1, 0, &[0.5, 1.5, 2.5]),
        triplet(0, 0, &[-1.0, 0.0]),
        triplet(0, 1, &[3.0]),
        triplet(1, 1, &[1.0, 1.0, 1.0, 1.0]),
    ];
    let merged = merge_triplets(&triplets).unwrap();
    assert_eq!(merged.dims(), ["arc", "channel", "tube", "length"]);
    assert_eq!(merged.event_count(), 10);

    let histogram = hist_events(&merged, &[("energy_transfer", BinSpec::Count(7))]).unwrap();
    assert_relative_eq!(histogram.total(), 10.0);

    let flat = merged.flatten(&["arc", "channel"], TRIPLET_DIM).unwrap();
    assert_eq!(flat.dims(), [TRIPLET_DIM, "tube", "length"]);
    assert_eq!(flat.event_count(), 10);
}

#[test]
fn test_irregular_triplets_keep_their_events() {
    let triplets = vec![triplet(0, 0, &[0.0, 1.0]), triplet(2, 3, &[2.0])];
    let merged = merge_triplets(&triplets).unwrap();
    assert_eq!(merged.dims(), [TRIPLET_DIM, "tube", "length"]);
    assert_eq!(merged.event_count(), 3);
    let histogram = hist_events(&merged, &[("energy_transfer", BinSpec::Count(2))]).unwrap();
    assert_relative_eq!(histogram.total(), 3.0);
}

#[test]
fn test_normalized_unit_is_counts_per_wavelength_and_charge() {
    let mut events = EventTable::unit_weights(vec![0, 0, 0]);
    events
        .insert_coord(
            NORMALIZATION_COORD,
            Variable::floats_1d(EVENT_DIM, vec![1.2, 1.7, 2.2], Unit::ANGSTROM),
        )
        .unwrap();
    let detector = DataArray::binned(&["pixel"], &[1], events, Unit::COUNTS).unwrap();

    let mut monitor = DataArray::dense(&Variable::floats_1d("tof", vec![2.0, 2.0], Unit::COUNTS), None).unwrap();
    monitor
        .insert_edges(
            NORMALIZATION_COORD,
            "tof",
            Variable::floats_1d("tof", vec![1.0, 2.0, 3.0], Unit::ANGSTROM),
        )
        .unwrap();
    let charge = Variable::scalar(4.0, Unit::MICRO_AMPERE_HOUR);
    let out = normalize_by_monitor_and_proton_charge(&detector, &monitor, &charge, UncertaintyBroadcastMode::Drop)
        .unwrap();
    assert_eq!(out.unit(), Unit::COUNTS / (Unit::INVERSE_ANGSTROM * Unit::MICRO_AMPERE_HOUR));
    // Flat monitor: density 0.5 per Å, so every weight becomes 1 / (0.5 * 4).
    for w in &out.events().unwrap().weights {
        assert_relative_eq!(*w, 0.5, max_relative = 1e-12);
    }
}
