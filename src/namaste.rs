//! NAMASTE source tables: the three traditional-medicine categories and the
//! fixed column layout each category's CSV export uses.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ayurveda,
    Unani,
    Siddha,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Ayurveda, Category::Unani, Category::Siddha];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ayurveda => "ayurveda",
            Category::Unani => "unani",
            Category::Siddha => "siddha",
        }
    }

    pub fn layout(self) -> &'static ColumnLayout {
        match self {
            Category::Ayurveda => &AYURVEDA_LAYOUT,
            Category::Unani => &UNANI_LAYOUT,
            Category::Siddha => &SIDDHA_LAYOUT,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown NAMASTE category: {s}"))
    }
}

/// Column positions of each record field within one category's CSV export.
#[derive(Debug, Clone, Copy)]
pub struct ColumnLayout {
    pub id: usize,
    pub code: usize,
    pub term: usize,
    pub diacritical: usize,
    pub native: usize,
    pub short_desc: usize,
    pub long_desc: usize,
}

impl ColumnLayout {
    fn width(&self) -> usize {
        [
            self.id,
            self.code,
            self.term,
            self.diacritical,
            self.native,
            self.short_desc,
            self.long_desc,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }
}

const AYURVEDA_LAYOUT: ColumnLayout = ColumnLayout {
    id: 1,
    code: 2,
    term: 3,
    diacritical: 4,
    native: 5,
    short_desc: 6,
    long_desc: 7,
};

// Unani exports carry no separate diacritical column; the term doubles as it.
const UNANI_LAYOUT: ColumnLayout = ColumnLayout {
    id: 1,
    code: 2,
    native: 3,
    term: 4,
    diacritical: 4,
    short_desc: 5,
    long_desc: 6,
};

const SIDDHA_LAYOUT: ColumnLayout = ColumnLayout {
    id: 1,
    code: 2,
    term: 3,
    diacritical: 3,
    native: 4,
    short_desc: 5,
    long_desc: 6,
};

/// One indexed NAMASTE row in the shape shared by all categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamasteRecord {
    pub category: Category,
    pub id: String,
    pub code: String,
    pub term: String,
    pub diacritical: String,
    pub native: String,
    pub short_desc: String,
    pub long_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryLoad {
    pub rows_read: u64,
    pub skipped_empty_term: u64,
}

/// Reads a category CSV, skipping the header row and rows with an empty term.
pub fn load_category(
    category: Category,
    path: &Path,
) -> Result<(Vec<NamasteRecord>, CategoryLoad)> {
    let file = std::fs::File::open(path).map_err(|e| BridgeError::Rebuild {
        category,
        reason: format!("open {}: {e}", path.display()),
    })?;
    read_category(category, file)
}

pub fn read_category<R: std::io::Read>(
    category: Category,
    input: R,
) -> Result<(Vec<NamasteRecord>, CategoryLoad)> {
    let layout = category.layout();
    let width = layout.width();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let mut out = Vec::new();
    let mut load = CategoryLoad::default();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(|e| BridgeError::Rebuild {
            category,
            reason: format!("row {}: {e}", idx + 2),
        })?;
        load.rows_read += 1;

        if row.len() < width {
            return Err(BridgeError::Rebuild {
                category,
                reason: format!(
                    "row {} has {} columns, layout needs {}",
                    idx + 2,
                    row.len(),
                    width
                ),
            });
        }

        let col = |i: usize| row.get(i).unwrap_or("").trim().to_string();
        let term = col(layout.term);
        if term.is_empty() {
            load.skipped_empty_term += 1;
            continue;
        }

        out.push(NamasteRecord {
            category,
            id: col(layout.id),
            code: col(layout.code),
            term,
            diacritical: col(layout.diacritical),
            native: col(layout.native),
            short_desc: col(layout.short_desc),
            long_desc: col(layout.long_desc),
        });
    }

    Ok((out, load))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AYURVEDA_CSV: &str = "\
Sr No.,NAMC_ID,NAMC_CODE,NAMC_term,NAMC_term_diacritical,NAMC_term_DEVANAGARI,Short_definition,Long_definition
1,1,AAA-1,vAtasancayaH,vātasañcayaḥ,वातसञ्चयः,Accumulation of vata,Vata accumulates in its own site
2,2,AAA-2,,,,,
3,3,AY12,visUcikA,visūcikā,विसूचिका,Cholera-like illness,Acute purging and vomiting
";

    #[test]
    fn ayurveda_rows_map_through_layout() {
        let (records, load) =
            read_category(Category::Ayurveda, AYURVEDA_CSV.as_bytes()).unwrap();
        assert_eq!(load.rows_read, 3);
        assert_eq!(load.skipped_empty_term, 1);
        assert_eq!(records.len(), 2);

        let r = &records[1];
        assert_eq!(r.category, Category::Ayurveda);
        assert_eq!(r.code, "AY12");
        assert_eq!(r.term, "visUcikA");
        assert_eq!(r.diacritical, "visūcikā");
        assert_eq!(r.long_desc, "Acute purging and vomiting");
    }

    #[test]
    fn unani_term_doubles_as_diacritical() {
        let csv = "\
Sr,NUMC_ID,NUMC_CODE,Arabic,NUMC_TERM,Short,Long
1,7,UN-7,نزله,nazla,Catarrh,Flow of humours to the nose
";
        let (records, _) = read_category(Category::Unani, csv.as_bytes()).unwrap();
        assert_eq!(records[0].term, "nazla");
        assert_eq!(records[0].diacritical, "nazla");
        assert_eq!(records[0].native, "نزله");
        assert_eq!(records[0].long_desc, "Flow of humours to the nose");
    }

    #[test]
    fn siddha_layout_is_shifted() {
        let csv = "\
Sr,NSMC_ID,NSMC_CODE,NSMC_TERM,Tamil,Short,Long
1,9,SD-9,Vali azhal,வளி அழல்,Short text,Long text
";
        let (records, _) = read_category(Category::Siddha, csv.as_bytes()).unwrap();
        assert_eq!(records[0].diacritical, "Vali azhal");
        assert_eq!(records[0].native, "வளி அழல்");
        assert_eq!(records[0].short_desc, "Short text");
    }

    #[test]
    fn short_row_aborts_with_category() {
        let csv = "h1,h2,h3\n1,2,3\n";
        let err = read_category(Category::Siddha, csv.as_bytes()).unwrap_err();
        match err {
            BridgeError::Rebuild { category, reason } => {
                assert_eq!(category, Category::Siddha);
                assert!(reason.contains("row 2"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_is_a_rebuild_error() {
        let err = load_category(Category::Unani, Path::new("/nonexistent/unani.csv")).unwrap_err();
        assert!(matches!(err, BridgeError::Rebuild { category: Category::Unani, .. }));
    }
}
