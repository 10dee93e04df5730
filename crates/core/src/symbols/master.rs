//! Symbol master import: a zip archive holding one CSV of listings
//! (`ticker,exchange,company_name[,mic[,tracked]]`).

use crate::symbols::{normalize_exchange, CompanyInfo};
use anyhow::{Context, Result};
use encoding_rs::WINDOWS_1252;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRecord {
    pub info: CompanyInfo,
    pub tracked: bool,
}

pub async fn load_master_zip(path: &std::path::Path) -> Result<Vec<MasterRecord>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read symbol master {} failed", path.display()))?;
    tokio::task::spawn_blocking(move || unzip_and_parse_master(&bytes))
        .await
        .context("join unzip task failed")?
}

pub fn unzip_and_parse_master(zip_bytes: &[u8]) -> Result<Vec<MasterRecord>> {
    use std::io::{Cursor, Read};

    let reader = Cursor::new(zip_bytes);
    let mut zip = zip::ZipArchive::new(reader).context("open zip archive failed")?;
    anyhow::ensure!(!zip.is_empty(), "zip has no entries");

    let mut csv_idx: Option<usize> = None;
    for i in 0..zip.len() {
        let name = {
            let f = zip.by_index(i).context("open zip entry failed")?;
            f.name().to_string()
        };
        if name.to_ascii_lowercase().ends_with(".csv") {
            csv_idx = Some(i);
            break;
        }
    }
    let idx = csv_idx.unwrap_or(0);

    let mut file = zip.by_index(idx).context("open zip entry failed")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).context("read zip entry failed")?;

    parse_master_csv(&buf)
}

pub fn parse_master_csv(buf: &[u8]) -> Result<Vec<MasterRecord>> {
    let text = decode_text(buf);
    let mut out = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_csv_line(line);
        if line_no == 0 && fields.first().is_some_and(|f| f.eq_ignore_ascii_case("ticker")) {
            continue;
        }
        if fields.len() < 3 {
            tracing::debug!(line_no, "skipping short symbol master line");
            continue;
        }

        let ticker = fields[0].trim().to_ascii_uppercase();
        let exchange = normalize_exchange(&fields[1]);
        let company_name = fields[2].trim().to_string();
        if ticker.is_empty() || exchange.is_empty() || company_name.is_empty() {
            continue;
        }
        let mic = fields
            .get(3)
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty());
        let tracked = fields
            .get(4)
            .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y"))
            .unwrap_or(false);

        out.push(MasterRecord {
            info: CompanyInfo {
                ticker,
                exchange,
                company_name,
                mic,
            },
            tracked,
        });
    }

    anyhow::ensure!(!out.is_empty(), "symbol master contains no listings");
    Ok(out)
}

// Masters exported from spreadsheet tools are often Windows-1252.
fn decode_text(buf: &[u8]) -> String {
    let buf = buf.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(buf);
    match std::str::from_utf8(buf) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (cow, _, _) = WINDOWS_1252.decode(buf);
            cow.into_owned()
        }
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_header_quotes_and_tracked_flag() {
        let csv = "ticker,exchange,company_name,mic,tracked\n\
                   AAPL,NasdaqGS,\"Apple, Inc.\",XNAS,1\n\
                   SHEL,LON,Shell plc,,\n";
        let out = parse_master_csv(csv.as_bytes()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].info.exchange, "NASDAQ");
        assert_eq!(out[0].info.company_name, "Apple, Inc.");
        assert!(out[0].tracked);
        assert_eq!(out[1].info.exchange, "LSE");
        assert_eq!(out[1].info.mic, None);
        assert!(!out[1].tracked);
    }

    #[test]
    fn decodes_windows_1252_names() {
        let (bytes, _, _) = WINDOWS_1252.encode("NESN,SWX,Nestlé S.A.\n");
        let out = parse_master_csv(&bytes).unwrap();
        assert_eq!(out[0].info.company_name, "Nestlé S.A.");
    }

    #[test]
    fn reads_csv_entry_from_zip() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("README.txt", opts).unwrap();
            zip.write_all(b"ignored").unwrap();
            zip.start_file("symbols.csv", opts).unwrap();
            zip.write_all(b"MSFT,NASDAQ,Microsoft Corporation\n").unwrap();
            zip.finish().unwrap();
        }
        let out = unzip_and_parse_master(&buf).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].info.ticker, "MSFT");
    }

    #[test]
    fn empty_master_is_an_error() {
        assert!(parse_master_csv(b"ticker,exchange,company_name\n").is_err());
    }
}
