//! Plate-detection log reader.
//!
//! The detector writes a CSV with a header row. Plates come from the `plate`
//! column when present, otherwise from the file name in `plate_path` (the
//! detector's crop image).

use std::path::Path;

/// Plates listed in the log at `path`. A missing file yields no plates.
pub fn read_plate_log(path: &Path) -> std::io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_plate_log(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

pub fn parse_plate_log(content: &str) -> Vec<String> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns = split_record(header);
    let plate_col = columns.iter().position(|c| c == "plate");
    let path_col = columns.iter().position(|c| c == "plate_path");

    lines
        .filter_map(|line| {
            let fields = split_record(line);
            if let Some(i) = plate_col {
                return fields.get(i).cloned();
            }
            let raw = fields.get(path_col?)?;
            Path::new(raw)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split one CSV record, honouring double-quoted fields.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}
