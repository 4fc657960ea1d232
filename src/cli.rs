// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! - Running the model on a sequence file
//! - Printing the effective configuration
//! - Listing checkpoint tensors

use depth_vsr::nn::WeightStore;
use depth_vsr::sequence::{SequenceFile, write_depth_pngs, write_sequence_file};
use depth_vsr::{
    Config, DevicePreference, HierarchicalDepthModel, Observation, OffloadPolicy, RefineSignal,
    SensorObservation,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct RunOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub flow_weights: Option<PathBuf>,
    pub png_dir: Option<PathBuf>,
    pub device: Option<DevicePreference>,
    pub offload: OffloadPolicy,
}

/// Explicit path, then the default location if it exists, then defaults
fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return Ok(Config::load(path)?);
    }
    match Config::default_path() {
        Some(path) if path.exists() => Ok(Config::load(&path)?),
        _ => Ok(Config::default()),
    }
}

/// Run the model on one sequence file
pub fn run_sequence(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(options.config.as_deref())?;
    if let Some(weights) = options.weights {
        config.pretrained = Some(weights);
    }
    if let Some(flow_weights) = options.flow_weights {
        config.flow_pretrained = Some(flow_weights);
    }
    if let Some(device) = options.device {
        config.device = device;
    }

    let mut input = SequenceFile::open(&options.input)?;
    let guides = input.take("guides")?;
    let observation = match config.refine_signal {
        RefineSignal::HistogramFeedback => Observation::Histogram(SensorObservation::from_packed(
            &input.take("observations")?,
            config.mpeaks,
        )?),
        RefineSignal::DepthConfidence => Observation::Depth(input.take("lqs")?),
    };

    let (n, t, _, h, w) = guides.dim();
    println!("Input: {}", options.input.display());
    println!("  Sequences: {}", n);
    println!("  Frames:    {}", t);
    println!("  Guide:     {}x{}", w, h);
    println!("  Scale:     {}x", config.scale);

    let mut model = HierarchicalDepthModel::new(config)?.with_offload_policy(options.offload);
    model.init_weights()?;
    if model.config().pretrained.is_none() {
        println!("No checkpoint configured, using initial weights.");
    }
    println!("Device: {}", model.device().name());

    let start = Instant::now();
    let output = model.forward(&observation, &guides)?;
    println!("Evaluated in {:.2}s", start.elapsed().as_secs_f64());

    write_sequence_file(
        &options.output,
        &[
            ("depth", &output.depth),
            ("stage1_depth", &output.stage1_depth),
            ("stage2_depth", &output.stage2_depth),
            ("stage1_weight", &output.stage1_weight),
            ("stage2_weight", &output.stage2_weight),
        ],
    )?;
    println!("Saved: {}", options.output.display());

    if let Some(dir) = options.png_dir {
        let written = write_depth_pngs(&dir, &output.depth)?;
        println!("Saved {} depth maps to {}", written.len(), dir.display());
    }

    Ok(())
}

/// Print the configuration the run command would use
pub fn print_config(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path.as_deref())?;
    config.validate()?;
    println!("{}", config.to_json()?);
    Ok(())
}

/// List tensor names and shapes of a checkpoint
pub fn inspect_weights(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = WeightStore::from_file(path, None, false)?;
    if store.is_empty() {
        println!("No tensors found.");
        return Ok(());
    }

    println!("Tensors in {}:", path.display());
    println!();
    let mut parameters = 0usize;
    for (name, shape) in store.entries() {
        parameters += shape.iter().product::<usize>();
        println!("  {} {:?}", name, shape);
    }
    println!();
    println!("{} tensors, {} parameters", store.len(), parameters);
    Ok(())
}
