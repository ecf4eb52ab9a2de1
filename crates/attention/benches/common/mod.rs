use std::{fs, io::Write, path::Path};

use candle_core::{DType, Device, Tensor};
use chunked_attention::RowMask;

#[derive(Clone, Copy)]
pub struct Case {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
    pub dtype: DType,
}

impl Case {
    pub fn describe(&self) -> String {
        format!(
            "({},{},{}x{},{})",
            self.batch, self.heads, self.q_len, self.k_len, self.head_dim
        )
    }

    /// Random `q`, `k`, `v` and a row mask hiding the last eighth of each
    /// sequence in every other batch element.
    pub fn inputs(
        &self,
        device: &Device,
    ) -> Result<(Tensor, Tensor, Tensor, RowMask), Box<dyn std::error::Error>> {
        let q = Tensor::randn(0.0f32, 1.0, (self.batch, self.heads, self.q_len, self.head_dim), device)?
            .to_dtype(self.dtype)?;
        let k = Tensor::randn(0.0f32, 1.0, (self.batch, self.heads, self.k_len, self.head_dim), device)?
            .to_dtype(self.dtype)?;
        let v = Tensor::randn(0.0f32, 1.0, (self.batch, self.heads, self.k_len, self.head_dim), device)?
            .to_dtype(self.dtype)?;
        let lengths: Vec<usize> = (0..self.batch)
            .map(|b| if b % 2 == 0 { self.k_len } else { self.k_len - self.k_len / 8 })
            .collect();
        let mask = RowMask::from_lengths(device, &lengths, self.k_len)?;
        Ok((q, k, v, mask))
    }
}

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = String::new();
    table.push_str("| ");
    table.push_str(&headers.join(" | "));
    table.push_str(" |\n| ");
    table.push_str(&headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    table.push_str(" |\n");
    for row in rows {
        table.push_str("| ");
        table.push_str(&row.join(" | "));
        table.push_str(" |\n");
    }
    table
}

/// Replaces (or appends) the marked `section` of the results file.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let marker = section.to_uppercase();
    let start_marker = format!("<!-- {marker}_START -->");
    let end_marker = format!("<!-- {marker}_END -->");

    let path = Path::new("crates/attention/benchmarks/RESULTS.md");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Chunked Attention Benchmarks\n\n".to_string()
    };
    let block = format!("{start_marker}\n{content}\n{end_marker}\n");

    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start), Some(end)) => {
            body.replace_range(start..end + end_marker.len(), block.trim_end())
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }

    let mut file = fs::File::create(path)?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

#[allow(dead_code)]
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    let diff = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0.0f32, f32::max))
}
