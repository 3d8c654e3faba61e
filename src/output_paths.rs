use std::path::{Path, PathBuf};

use regex::Regex;

fn run_number(file_name: &str) -> Option<i64> {
    let re = Regex::new(r"Run_([+-]?\d+)").ok()?;
    re.captures(file_name)?.get(1)?.as_str().parse().ok()
}

/// `Run_60184_Waveform.parquet` -> `Run60184`, `sample_Waveform.parquet` -> `sample`,
/// anything else -> the file stem.
pub fn extract_run_tag(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(run) = run_number(&file_name) {
        return format!("Run{run}");
    }

    if let Some(index) = file_name.find("_Waveform") {
        if index > 0 {
            return file_name[..index].to_owned();
        }
    }

    match file_name.rfind('.') {
        Some(dot) if dot > 0 => file_name[..dot].to_owned(),
        _ => file_name,
    }
}

/// Where every artifact of one run is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub dir: PathBuf,
    pub run_tag: String,
    pub layer: Option<u32>,
}

impl OutputPaths {
    pub fn new(dir: &Path, run_tag: &str, layer: Option<u32>) -> Self {
        OutputPaths {
            dir: dir.to_path_buf(),
            run_tag: run_tag.to_owned(),
            layer,
        }
    }

    pub fn for_input(dir: &Path, input: &Path, layer: Option<u32>) -> Self {
        Self::new(dir, &extract_run_tag(input), layer)
    }

    fn file(&self, stem: &str, extension: &str) -> PathBuf {
        let name = match self.layer {
            Some(layer) => format!("{stem}_{}_layer{layer}.{extension}", self.run_tag),
            None => format!("{stem}_{}.{extension}", self.run_tag),
        };
        self.dir.join(name)
    }

    pub fn calibration_table(&self) -> PathBuf {
        self.file("calibration_bic_output", "parquet")
    }

    pub fn calibration_text(&self) -> PathBuf {
        self.file("calibration_constants", "txt")
    }

    pub fn calibration_qa(&self) -> PathBuf {
        self.file("calibration_QA", "json")
    }

    pub fn calibrated_events(&self) -> PathBuf {
        self.file("energy_calibrated", "parquet")
    }

    pub fn energy_qa(&self) -> PathBuf {
        self.file("energy_calibration_QC", "json")
    }

    pub fn integrated_adc_qa(&self) -> PathBuf {
        self.file("intADC_QA", "json")
    }
}
