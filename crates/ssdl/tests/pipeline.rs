use approx::assert_relative_eq;
use ssdl::{
    data::{test_lepton, Triggers},
    fakes::ratio::ratio_with_binom_errors,
    Analysis, AnalysisConfig, AnalysisYields, Channel, ChargeRelation, EventRecord,
    FakeRateMatrixSolver, Flavor, Jet, LegRatios, ObservedCounts, Sample, SampleKind,
    SampleRegistry, Stream, Topology,
};

fn jet(pt: f64, phi: f64) -> Jet {
    Jet { pt, eta: 0.0, phi }
}

fn muon(rng: &mut fastrand::Rng, pt: f64, phi: f64, charge: i32, tight_prob: f64) -> ssdl::Lepton {
    let mut lepton = test_lepton(Flavor::Muon, pt, rng.f64() * 3.0 - 1.5, phi, charge);
    if rng.f64() >= tight_prob {
        lepton.iso = 0.2 + 0.6 * rng.f64();
    }
    lepton
}

/// Same-sign dimuon events with random kinematics.
fn signal_events(rng: &mut fastrand::Rng, n: usize) -> Vec<EventRecord> {
    (0..n)
        .map(|i| EventRecord {
            event: i as u64,
            triggers: Triggers {
                double_mu: true,
                ..Triggers::default()
            },
            leptons: vec![
                {
                    let pt = 25.0 + 30.0 * rng.f64();
                    muon(rng, pt, 0.3, 1, 0.7)
                },
                {
                    let pt = 12.0 + 10.0 * rng.f64();
                    muon(rng, pt, 1.6, 1, 0.6)
                },
            ],
            jets: vec![
                jet(60.0 + 300.0 * rng.f64(), -1.0),
                jet(35.0 + 100.0 * rng.f64(), -1.8),
                jet(30.0 + 60.0 * rng.f64(), -2.6),
            ],
            met: 150.0 * rng.f64(),
            ..EventRecord::default()
        })
        .collect()
}

/// Opposite-sign dimuons at the Z peak for the prompt ratio.
fn z_events(rng: &mut fastrand::Rng, n: usize) -> Vec<EventRecord> {
    (0..n)
        .map(|i| {
            let mut measured = test_lepton(Flavor::Muon, 45.0, 0.0, std::f64::consts::PI, -1);
            if rng.f64() >= 0.9 {
                measured.iso = 0.5;
            }
            EventRecord {
                event: 10_000 + i as u64,
                triggers: Triggers {
                    double_mu: true,
                    ..Triggers::default()
                },
                leptons: vec![test_lepton(Flavor::Muon, 45.0, 0.0, 0.0, 1), measured],
                jets: vec![jet(40.0, 1.5), jet(35.0, -1.5)],
                met: 10.0,
                ..EventRecord::default()
            }
        })
        .collect()
}

/// Single-muon events in the QCD-enriched region for the fake ratio.
fn qcd_events(rng: &mut fastrand::Rng, n: usize) -> Vec<EventRecord> {
    (0..n)
        .map(|i| {
            let pt = 15.0 + 30.0 * rng.f64();
            let mut lepton = muon(rng, pt, 0.5, 1, 0.2);
            lepton.mt = 5.0;
            EventRecord {
                event: 20_000 + i as u64,
                triggers: Triggers {
                    single_mu: true,
                    ..Triggers::default()
                },
                leptons: vec![lepton],
                jets: vec![jet(70.0, -2.0)],
                met: 10.0,
                ..EventRecord::default()
            }
        })
        .collect()
}

fn data_analysis() -> Analysis {
    data_analysis_with(AnalysisConfig::default(), false)
}

/// Data samples for a DoubleMu/SingleMu analysis. With `flip_some` every third signal event
/// has an opposite-sign pair.
fn data_analysis_with(config: AnalysisConfig, flip_some: bool) -> Analysis {
    let mut rng = fastrand::Rng::with_seed(2024);
    let mut double_mu = signal_events(&mut rng, 300);
    if flip_some {
        for event in double_mu.iter_mut().step_by(3) {
            event.leptons[1].charge = -1;
        }
    }
    double_mu.extend(z_events(&mut rng, 200));
    let single_mu = qcd_events(&mut rng, 400);
    let mut registry = SampleRegistry::new(config.target_lumi);
    registry.add(
        Sample::in_memory(
            "DoubleMu",
            SampleKind::Data,
            0.0,
            Some(Stream::DoubleMu),
            double_mu,
            config.target_lumi,
        )
        .unwrap(),
    );
    registry.add(
        Sample::in_memory(
            "SingleMu",
            SampleKind::Data,
            0.0,
            Some(Stream::SingleMu),
            single_mu,
            config.target_lumi,
        )
        .unwrap(),
    );
    Analysis::new(config, registry).unwrap()
}

#[test]
fn test_data_prediction_matches_direct_solve() {
    let mut analysis = data_analysis();
    let yields = analysis.accumulate().unwrap();
    let prediction = analysis.predict(&yields, "Baseline").unwrap();
    assert!(prediction.failed_channels.is_empty());
    assert!(prediction.ratios.muon.is_ok());
    assert!(prediction.ratios.electron.is_err());

    let ss = &yields.same_sign;
    let (z, qcd) = (
        ss.numbers("DoubleMu", "Baseline", Channel::MuMu),
        ss.numbers("SingleMu", "Baseline", Channel::MuMu),
    );
    assert_relative_eq!(z.nzl, 200.0);
    assert_relative_eq!(qcd.nssl, 400.0);
    let p = ratio_with_binom_errors(z.nzt, z.nzl).unwrap();
    let f = ratio_with_binom_errors(qcd.nsst, qcd.nssl).unwrap();
    let legs = [LegRatios::from_ratios(&p, &f); 2];
    let direct = FakeRateMatrixSolver::default()
        .solve(
            Topology::SameFlavor(Flavor::Muon),
            &legs,
            &ObservedCounts::from_numbers(&ss.numbers("DoubleMu", "Baseline", Channel::MuMu)),
        )
        .unwrap();
    let mumu = prediction.channel(Channel::MuMu).unwrap();
    assert_relative_eq!(mumu.fake().value, direct.predicted_fake().value, epsilon = 1e-9);
    assert_relative_eq!(mumu.fake().stat, direct.predicted_fake().stat, epsilon = 1e-9);
    assert!(mumu.fake().value > 0.0);
    assert_relative_eq!(
        mumu.observed,
        ss.numbers("DoubleMu", "Baseline", Channel::MuMu).nt2
    );
    assert_relative_eq!(mumu.charge_misid.value, 0.0);
}

#[test]
fn test_tighter_regions_select_subsets() {
    let mut analysis = data_analysis();
    let yields = analysis.accumulate().unwrap();
    let ss = &yields.same_sign;
    let baseline = ss.numbers("DoubleMu", "Baseline", Channel::MuMu);
    assert!(baseline.n_pairs() > 0.0);
    let nested = [
        ("HT80MET100", "Baseline"),
        ("HT200MET30", "Baseline"),
        ("HT200MET120", "HT200MET30"),
        ("HT200MET120", "HT80MET100"),
        ("HT400MET50", "HT200MET30"),
        ("HT400MET120", "HT400MET50"),
        ("HT400MET120", "HT200MET120"),
    ];
    for (tight, loose) in nested {
        let (t, l) = (
            ss.numbers("DoubleMu", tight, Channel::MuMu),
            ss.numbers("DoubleMu", loose, Channel::MuMu),
        );
        assert!(t.nt2 <= l.nt2, "{} has more Nt2 than {}", tight, loose);
        assert!(t.nt10 <= l.nt10, "{} has more Nt10 than {}", tight, loose);
        assert!(t.nt0 <= l.nt0, "{} has more Nt0 than {}", tight, loose);
    }
}

#[test]
fn test_simulation_normalization_doubles_contribution() {
    let config = AnalysisConfig::default();
    let mut rng = fastrand::Rng::with_seed(99);
    let mut events = signal_events(&mut rng, 200);
    events.extend(z_events(&mut rng, 100));
    let mut qcd = qcd_events(&mut rng, 200);
    for event in qcd.iter_mut() {
        event.triggers.double_mu = false;
    }
    events.extend(qcd);
    let mut registry = SampleRegistry::new(config.target_lumi);
    for (name, lumi) in [("Half", 500.0), ("Full", 1000.0)] {
        registry.add(
            Sample::in_memory(
                name,
                SampleKind::Background,
                lumi,
                None,
                events.clone(),
                config.target_lumi,
            )
            .unwrap(),
        );
    }
    assert_relative_eq!(registry.get("Half").unwrap().scale(), 2.0);
    let mut analysis = Analysis::new(config, registry).unwrap();
    let yields = analysis.accumulate().unwrap();
    let closure = analysis.closure(&yields, "Baseline").unwrap();
    let mumu = closure.channel(Channel::MuMu).unwrap();
    let (half, full) = (&mumu.per_sample["Half"], &mumu.per_sample["Full"]);
    assert_relative_eq!(
        half.predicted_fake().value,
        2.0 * full.predicted_fake().value,
        epsilon = 1e-9
    );
    assert_relative_eq!(
        mumu.fake().value,
        3.0 * full.predicted_fake().value,
        epsilon = 1e-9
    );
    assert_relative_eq!(
        mumu.observed,
        3.0 * yields.same_sign.numbers("Full", "Baseline", Channel::MuMu).nt2,
        epsilon = 1e-9
    );
}

#[test]
fn test_yields_round_trip_and_report() {
    let mut analysis = data_analysis();
    let yields = analysis.accumulate().unwrap();
    let path = std::env::temp_dir().join(format!("ssdl-yields-{}.json", std::process::id()));
    let path_str = path.to_string_lossy().to_string();
    yields.save(&path_str).unwrap();
    let loaded = AnalysisYields::load(&path_str).unwrap();
    assert_eq!(loaded, yields);
    std::fs::remove_file(path).unwrap();

    let report = analysis.report(&loaded, "Baseline", false, true).unwrap();
    assert!(report.contains("Region Baseline"));
    assert!(report.contains("PREDICTIONS"));
    assert!(report.contains("CUT FLOW"));
    assert!(report.contains("Mu/Mu"));
    assert!(analysis.report(&loaded, "NoSuchRegion", false, false).is_err());
}

#[test]
fn test_charge_setting_selects_predicted_pairs() {
    let mut same_sign = data_analysis_with(AnalysisConfig::default(), true);
    let yields = same_sign.accumulate().unwrap();
    let mut config = AnalysisConfig::default();
    config.selection.charge = ChargeRelation::OppositeSign;
    let opposite_sign = data_analysis_with(config, true);
    assert_eq!(opposite_sign.charge(), ChargeRelation::OppositeSign);

    let ss = same_sign.predict(&yields, "Baseline").unwrap();
    let os = opposite_sign.predict(&yields, "Baseline").unwrap();
    let (ss_mumu, os_mumu) = (
        ss.channel(Channel::MuMu).unwrap(),
        os.channel(Channel::MuMu).unwrap(),
    );
    let ss_nt2 = yields.same_sign.numbers("DoubleMu", "Baseline", Channel::MuMu).nt2;
    let os_nt2 = yields.opposite_sign.numbers("DoubleMu", "Baseline", Channel::MuMu).nt2;
    assert!(ss_nt2 > 0.0);
    assert!(os_nt2 > 0.0);
    assert_relative_eq!(ss_mumu.observed, ss_nt2);
    assert_relative_eq!(os_mumu.observed, os_nt2);
    assert!(ss_mumu.observed != os_mumu.observed);
    assert!(ss_mumu.fake().value != os_mumu.fake().value);
    // opposite-sign pairs have no charge misidentification background
    assert!(os.channels.iter().all(|c| c.charge_misid.value == 0.0));
}
