use std::fmt::{self, Display, Formatter};

use ssdl_core::{Channel, NumberSet, Sample, SampleKind, YieldStore};

use crate::{
    matrix::Estimate,
    prediction::{CombinedPrediction, FakeRateSet},
};

const RULE: &str =
    "------------------------------------------------------------------------------------------";

fn section(f: &mut Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f, "{}", RULE)?;
    writeln!(f, " {}", title)?;
    writeln!(f, "{}", RULE)
}

fn estimate_line(f: &mut Formatter<'_>, label: &str, estimate: &Estimate) -> fmt::Result {
    writeln!(
        f,
        "   {:<16}: {:>9.3} +/- {:>7.3} (stat) +/- {:>7.3} (syst)",
        label, estimate.value, estimate.stat, estimate.syst
    )
}

/// Sum of the normalized counters of `samples`.
fn pooled(store: &YieldStore, samples: &[&Sample], region: &str, channel: Channel) -> NumberSet {
    samples.iter().fold(NumberSet::default(), |acc, s| {
        acc + store.numbers(&s.sname, region, channel).scaled(s.scale())
    })
}

/// Prompt and fake ratios of both flavors.
pub struct RatioTable<'a>(pub &'a FakeRateSet);

impl Display for RatioTable<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, " {:<10}| {:<24}| {:<24}", "", "fRatio", "pRatio")?;
        for (label, ratios) in [("Mu", &self.0.muon), ("El", &self.0.electron)] {
            match ratios {
                Ok(r) => writeln!(
                    f,
                    " {:<10}| {:<24}| {:<24}",
                    label,
                    r.fake.to_string(),
                    r.prompt.to_string()
                )?,
                Err(err) => writeln!(f, " {:<10}| unavailable: {}", label, err)?,
            }
        }
        Ok(())
    }
}

/// Per-sample counters of one region and channel, with sums over simulation and data.
pub struct YieldTable<'a> {
    pub store: &'a YieldStore,
    pub samples: &'a [&'a Sample],
    pub region: &'a str,
    pub channel: Channel,
}

impl YieldTable<'_> {
    fn row(f: &mut Formatter<'_>, name: &str, n: &NumberSet) -> fmt::Result {
        writeln!(
            f,
            " {:<16}|{:>9.2}{:>9.2}{:>9.2}{:>9.2} |{:>9.2}{:>9.2} |{:>9.2}{:>9.2}",
            name, n.nt2, n.nt10, n.nt01, n.nt0, n.nsst, n.nssl, n.nzt, n.nzl
        )
    }
}

impl Display for YieldTable<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " {:<16}|{:>9}{:>9}{:>9}{:>9} |{:>9}{:>9} |{:>9}{:>9}",
            self.channel.label(),
            "Nt2",
            "Nt10",
            "Nt01",
            "Nt0",
            "Nsst",
            "Nssl",
            "NZt",
            "NZl"
        )?;
        let (mc, data): (Vec<&Sample>, Vec<&Sample>) =
            self.samples.iter().copied().partition(|s| !s.is_data());
        for sample in &mc {
            let n = self
                .store
                .numbers(&sample.sname, self.region, self.channel)
                .scaled(sample.scale());
            Self::row(f, &sample.sname, &n)?;
        }
        let background: Vec<&Sample> = mc
            .iter()
            .copied()
            .filter(|s| s.kind == SampleKind::Background)
            .collect();
        Self::row(
            f,
            "MC sum",
            &pooled(self.store, &background, self.region, self.channel),
        )?;
        for sample in &data {
            let n = self.store.numbers(&sample.sname, self.region, self.channel);
            Self::row(f, &sample.sname, &n)?;
        }
        if data.len() > 1 {
            Self::row(f, "data", &pooled(self.store, &data, self.region, self.channel))?;
        }
        Ok(())
    }
}

/// Weighted cut flow of one region and channel, one column per sample.
pub struct CutFlowTable<'a> {
    pub store: &'a YieldStore,
    pub samples: &'a [&'a Sample],
    pub region: &'a str,
    pub channel: Channel,
}

impl Display for CutFlowTable<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let flows: Vec<_> = self
            .samples
            .iter()
            .filter_map(|s| {
                self.store
                    .get(&s.sname, self.region, self.channel)
                    .map(|y| (s.sname.as_str(), &y.cutflow))
            })
            .collect();
        write!(f, " {:<12}", self.channel.label())?;
        for (name, _) in &flows {
            write!(f, "|{:>12}", name)?;
        }
        writeln!(f)?;
        let mut steps: Vec<&str> = Vec::new();
        for (_, flow) in &flows {
            for (step, _) in flow.iter() {
                if !steps.contains(&step) {
                    steps.push(step);
                }
            }
        }
        for step in steps {
            write!(f, " {:<12}", step)?;
            for (_, flow) in &flows {
                write!(f, "|{:>12.1}", flow.get(step))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Per-channel predictions and the combined totals.
pub struct PredictionTable<'a>(pub &'a CombinedPrediction);

impl Display for PredictionTable<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let prediction = self.0;
        for channel in &prediction.channels {
            writeln!(f, " {}", channel.channel.label())?;
            let labels = channel.fake.topology.component_labels();
            for (label, estimate) in labels
                .iter()
                .zip(&channel.fake.tight_tight.components)
            {
                estimate_line(f, label, estimate)?;
            }
            estimate_line(f, "Total fakes", &channel.fake())?;
            estimate_line(f, "Charge MisID", &channel.charge_misid)?;
            estimate_line(f, "Total bkg", &channel.total_background())?;
            writeln!(f, "   {:<16}: {:>9.3}", "Observed", channel.observed)?;
        }
        for (channel, err) in &prediction.failed_channels {
            writeln!(f, " {}: no prediction ({})", channel.label(), err)?;
        }
        writeln!(f, " Combined")?;
        estimate_line(f, "Total fakes", &prediction.fake())?;
        estimate_line(f, "Charge MisID", &prediction.charge_misid())?;
        let total = prediction.total_background();
        estimate_line(f, "Total bkg", &total)?;
        writeln!(
            f,
            "   {:<16}: {:>9.3} +/- {:>7.3}",
            "Total (comb.)",
            total.value,
            total.total_error()
        )?;
        writeln!(f, "   {:<16}: {:>9.3}", "Observed", prediction.observed())
    }
}

/// The full text report of one region.
pub struct Report<'a> {
    pub prediction: &'a CombinedPrediction,
    pub store: &'a YieldStore,
    pub samples: &'a [&'a Sample],
    /// Closure test on simulation, if run.
    pub closure: Option<&'a CombinedPrediction>,
    pub with_cutflow: bool,
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let p = self.prediction;
        writeln!(f, "{}", RULE)?;
        writeln!(
            f,
            " Region {} ({} pairs, {:?} prediction)",
            p.region,
            self.store.charge(),
            p.mode
        )?;
        section(f, "RATIOS")?;
        write!(f, "{}", RatioTable(&p.ratios))?;
        section(f, "YIELDS")?;
        for channel in Channel::ALL {
            write!(
                f,
                "{}",
                YieldTable {
                    store: self.store,
                    samples: self.samples,
                    region: &p.region,
                    channel,
                }
            )?;
            if let Some(prediction) = p.channel(channel) {
                writeln!(
                    f,
                    " {:<16}|{:>9.2}",
                    "tot. pred. fakes",
                    prediction.fake().value
                )?;
            }
        }
        section(f, "PREDICTIONS")?;
        write!(f, "{}", PredictionTable(p))?;
        if let Some(closure) = self.closure {
            section(f, "MC CLOSURE")?;
            write!(f, "{}", PredictionTable(closure))?;
        }
        if self.with_cutflow {
            section(f, "CUT FLOW")?;
            for channel in Channel::ALL {
                write!(
                    f,
                    "{}",
                    CutFlowTable {
                        store: self.store,
                        samples: self.samples,
                        region: &p.region,
                        channel,
                    }
                )?;
            }
        }
        let bins: Vec<_> = p.excluded_bins().collect();
        if !bins.is_empty() || !p.excluded_samples.is_empty() {
            section(f, "EXCLUDED")?;
            for sample in &p.excluded_samples {
                writeln!(f, " sample {}: {}", sample.name, sample.reason)?;
            }
            for (channel, sample, bin) in bins {
                writeln!(f, " {} {}: {}", channel.label(), sample, bin)?;
            }
        }
        writeln!(f, "{}", RULE)
    }
}
