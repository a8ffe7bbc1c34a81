use std::{collections::BTreeMap, path::Path};

use anyhow::Context;

/// Write value counts as a two column CSV with the given header.
pub fn write_counts_csv(
    counts: &BTreeMap<String, usize>,
    output_filepath: &Path,
    header: &[String; 2],
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(output_filepath)
        .with_context(|| format!("Creating CSV file {:?}", output_filepath))?;
    writer.write_record(header)?;
    for (value, count) in counts {
        writer.serialize((value, count))?;
    }
    writer.flush()?;
    log::info!("Wrote {} counts to {:?}", counts.len(), output_filepath);
    Ok(())
}
