//! `umbra label`: add one labelled image to the dataset.

use super::{CommandStatus, print_json};
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use umbra_training::{AppConfig, DataManifest, DatasetWriter, Label, read_label_file};

#[derive(Args, Debug)]
pub struct LabelArgs {
    /// Image file to add
    #[arg(long)]
    image: PathBuf,

    /// Image width in pixels
    #[arg(long)]
    width: u32,

    /// Image height in pixels
    #[arg(long)]
    height: u32,

    /// Bounding box in pixels (repeatable)
    #[arg(long = "box", value_name = "X1,Y1,X2,Y2,CLASS", value_parser = parse_box)]
    boxes: Vec<Label>,

    /// YOLO label file holding the image's boxes, instead of --box
    #[arg(long, conflicts_with = "boxes")]
    labels: Option<PathBuf>,

    /// Data manifest naming the train/valid lists (defaults to the configured one)
    #[arg(long)]
    data: Option<PathBuf>,
}

fn parse_box(raw: &str) -> Result<Label, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [x1, y1, x2, y2, class] = parts.as_slice() else {
        return Err(format!("expected X1,Y1,X2,Y2,CLASS, got {raw:?}"));
    };
    let coord = |s: &str| s.parse::<f64>().map_err(|e| format!("bad coordinate {s:?}: {e}"));
    Ok(Label {
        x1: coord(x1)?,
        y1: coord(y1)?,
        x2: coord(x2)?,
        y2: coord(y2)?,
        class: class.parse().map_err(|e| format!("bad class {class:?}: {e}"))?,
    })
}

pub fn execute(config: &AppConfig, args: LabelArgs) -> anyhow::Result<CommandStatus> {
    let data = args
        .data
        .or_else(|| config.data_file.clone())
        .context("no data manifest given and none configured")?;
    let manifest = DataManifest::read_file(&data).with_context(|| format!("failed to read {}", data.display()))?;
    let image = std::fs::read(&args.image).with_context(|| format!("failed to read {}", args.image.display()))?;
    let ext = args.image.extension().and_then(|e| e.to_str()).unwrap_or("jpg");

    let boxes = match &args.labels {
        Some(path) => read_label_file(path, args.width, args.height)
            .with_context(|| format!("failed to read labels from {}", path.display()))?,
        None => args.boxes,
    };

    let mut writer = DatasetWriter::open(config.layout(), &manifest, config.dataset_split)?;
    let sample = writer.add_sample(&image, ext, &boxes, args.width, args.height)?;
    print_json(&sample)?;
    Ok(CommandStatus::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_box() {
        let label = parse_box("10, 20,110,220,3").unwrap();
        assert_eq!(label, Label { x1: 10.0, y1: 20.0, x2: 110.0, y2: 220.0, class: 3 });
        assert!(parse_box("1,2,3,4").is_err());
        assert!(parse_box("1,2,3,4,cat").is_err());
    }
}
