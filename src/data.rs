//! Listing loading and cleaning using Polars

use crate::config::{PipelineConfig, COLUMN_MAP};
use crate::error::{InputError, PipelineError, Stage};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::{debug, info};

/// Listings from this year or earlier are dropped
pub const MIN_YEAR: i64 = 1990;

/// One used-car sales record
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub price: f64,
    pub year: i64,
    pub mileage: f64,
    pub fuel: String,
    pub gearbox: String,
    pub car_type: String,
    pub engine_hp: f64,
}

impl Listing {
    /// Range filter applied before deduplication
    pub fn in_valid_range(&self) -> bool {
        self.price > 0.0 && self.mileage > 0.0 && self.year > MIN_YEAR
    }

    /// No missing values. NaN counts as missing.
    pub fn is_complete(&self) -> bool {
        self.price.is_finite() && self.mileage.is_finite() && self.engine_hp.is_finite()
    }

    /// Exact identity across every selected column
    fn identity(&self) -> (u64, i64, u64, &str, &str, &str, u64) {
        (
            self.price.to_bits(),
            self.year,
            self.mileage.to_bits(),
            &self.fuel,
            &self.gearbox,
            &self.car_type,
            self.engine_hp.to_bits(),
        )
    }
}

/// Cleaned, immutable listings in source order
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedDataset {
    listings: Vec<Listing>,
}

impl CleanedDataset {
    /// Build a dataset from records that are already clean.
    ///
    /// Fails if any record breaks the range filter, has a missing value or
    /// duplicates an earlier record.
    pub fn from_listings(listings: Vec<Listing>) -> crate::Result<Self> {
        if listings.is_empty() {
            return Err(InputError::Empty.into());
        }

        let mut seen = HashSet::with_capacity(listings.len());
        for (row, listing) in listings.iter().enumerate() {
            if !listing.in_valid_range() || !listing.is_complete() {
                return Err(PipelineError::stage(
                    Stage::Load,
                    format!("row {row} does not satisfy the cleaning invariant"),
                ));
            }
            if !seen.insert(listing.identity()) {
                return Err(PipelineError::stage(
                    Stage::Load,
                    format!("row {row} duplicates an earlier row"),
                ));
            }
        }

        Ok(Self { listings })
    }

    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

/// Read the configured CSV file and clean it
///
/// # Arguments
/// * `config` - Input path, separator, sample cap and seed
///
/// # Returns
/// * `CleanedDataset` with at most `config.sample_cap` listings in source order
pub fn load_dataset(config: &PipelineConfig) -> crate::Result<CleanedDataset> {
    debug!(path = %config.input.display(), "reading listings");

    let parse_options = CsvParseOptions::default().with_separator(config.separator);
    // Every column is read as text; `clean_frame` casts it non-strictly
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_parse_options(parse_options)
        .try_into_reader_with_file_path(Some(config.input.clone()))
        .and_then(|reader| reader.finish())
        .map_err(|source| InputError::Read {
            path: config.input.clone(),
            source,
        })?;

    clean_frame(df, config)
}

/// Select, rename, filter, deduplicate and subsample a raw listings frame
pub fn clean_frame(mut df: DataFrame, config: &PipelineConfig) -> crate::Result<CleanedDataset> {
    let raw_rows = df.height();

    let trimmed: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.trim().to_string())
        .collect();
    df.set_column_names(trimmed.as_slice())?;

    for (raw, _) in COLUMN_MAP {
        if !trimmed.iter().any(|name| name.as_str() == raw) {
            return Err(InputError::MissingColumn {
                column: raw.to_string(),
            }
            .into());
        }
    }

    let selection: Vec<Expr> = COLUMN_MAP
        .iter()
        .map(|(raw, canonical)| col(raw).cast(canonical_dtype(canonical)).alias(canonical))
        .collect();

    let cleaned = df
        .lazy()
        .select(selection)
        .filter(
            col("price")
                .gt(lit(0.0))
                .and(col("mileage").gt(lit(0.0)))
                .and(col("year").gt(lit(MIN_YEAR))),
        )
        .unique_stable(None, UniqueKeepStrategy::First)
        .drop_nulls(None)
        .collect()?;

    let mut listings = frame_to_listings(&cleaned)?;
    listings.retain(Listing::is_complete);

    if listings.is_empty() {
        return Err(InputError::Empty.into());
    }

    let cleaned_rows = listings.len();
    let listings = sample_rows(listings, config.sample_cap, config.seed);

    info!(
        raw_rows,
        cleaned_rows,
        kept_rows = listings.len(),
        "listings cleaned"
    );

    Ok(CleanedDataset { listings })
}

fn canonical_dtype(canonical: &str) -> DataType {
    match canonical {
        "price" | "mileage" | "engine_hp" => DataType::Float64,
        "year" => DataType::Int64,
        _ => DataType::String,
    }
}

fn frame_to_listings(df: &DataFrame) -> crate::Result<Vec<Listing>> {
    let price = df.column("price")?.f64()?;
    let year = df.column("year")?.i64()?;
    let mileage = df.column("mileage")?.f64()?;
    let fuel = df.column("fuel")?.str()?;
    let gearbox = df.column("gearbox")?.str()?;
    let car_type = df.column("car_type")?.str()?;
    let engine_hp = df.column("engine_hp")?.f64()?;

    let listings = price
        .into_no_null_iter()
        .zip(year.into_no_null_iter())
        .zip(mileage.into_no_null_iter())
        .zip(fuel.into_no_null_iter())
        .zip(gearbox.into_no_null_iter())
        .zip(car_type.into_no_null_iter())
        .zip(engine_hp.into_no_null_iter())
        .map(
            |((((((price, year), mileage), fuel), gearbox), car_type), engine_hp)| Listing {
                price,
                year,
                mileage,
                fuel: fuel.to_string(),
                gearbox: gearbox.to_string(),
                car_type: car_type.to_string(),
                engine_hp,
            },
        )
        .collect();

    Ok(listings)
}

/// Uniform sample of `cap` rows without replacement, kept in source order
fn sample_rows(listings: Vec<Listing>, cap: usize, seed: u64) -> Vec<Listing> {
    if listings.len() <= cap {
        return listings;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut keep = vec![false; listings.len()];
    for index in rand::seq::index::sample(&mut rng, listings.len(), cap) {
        keep[index] = true;
    }

    listings
        .into_iter()
        .zip(keep)
        .filter_map(|(listing, kept)| kept.then_some(listing))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str =
        " Price-$, Manufactured Year ,Mileage-KM,Energy,Gearbox,Car Type ,Engine Power-HP";

    fn write_csv(header: &str, rows: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{header}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file
    }

    fn config_for(file: &NamedTempFile) -> PipelineConfig {
        PipelineConfig::new(file.path(), ".")
    }

    #[test]
    fn test_load_trims_headers_and_renames() {
        let file = write_csv(
            HEADER,
            &[
                "12000,2015,85000,Diesel,Manual,SUV,150",
                "8500,2012,120000,Petrol,Automatic,Sedan,110",
            ],
        );

        let dataset = load_dataset(&config_for(&file)).unwrap();
        assert_eq!(dataset.len(), 2);

        let first = &dataset.listings()[0];
        assert_eq!(first.price, 12000.0);
        assert_eq!(first.year, 2015);
        assert_eq!(first.mileage, 85000.0);
        assert_eq!(first.fuel, "Diesel");
        assert_eq!(first.gearbox, "Manual");
        assert_eq!(first.car_type, "SUV");
        assert_eq!(first.engine_hp, 150.0);
    }

    #[test]
    fn test_filters_invalid_duplicate_and_incomplete_rows() {
        let file = write_csv(
            HEADER,
            &[
                "12000,2015,85000,Diesel,Manual,SUV,150",
                "0,2015,85000,Diesel,Manual,SUV,150",
                "9000,2014,0,Petrol,Manual,Sedan,90",
                "7000,1990,150000,Petrol,Manual,Sedan,75",
                "12000,2015,85000,Diesel,Manual,SUV,150",
                "11000,2016,60000,,Manual,SUV,140",
                "10500,2017,40000,Hybrid,Automatic,Hatchback,",
                "15000,2019,20000,Electric,Automatic,SUV,200",
            ],
        );

        let dataset = load_dataset(&config_for(&file)).unwrap();
        let prices: Vec<f64> = dataset.listings().iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![12000.0, 15000.0]);

        for listing in dataset.listings() {
            assert!(listing.in_valid_range());
            assert!(listing.is_complete());
        }
    }

    #[test]
    fn test_unparsable_cell_late_in_file_drops_only_that_row() {
        let mut rows: Vec<String> = (0..1500)
            .map(|i| {
                format!(
                    "{},{},{},Diesel,Manual,SUV,{}",
                    3000 + i * 10,
                    1995 + i % 30,
                    5000 + i * 50,
                    80 + i % 120
                )
            })
            .collect();
        rows[1200] = "N/A,2010,70000,Petrol,Manual,Sedan,95".to_string();
        rows[1300] = "14000,2018,n/a,Petrol,Automatic,Sedan,120".to_string();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let file = write_csv(HEADER, &row_refs);

        let dataset = load_dataset(&config_for(&file)).unwrap();
        assert_eq!(dataset.len(), 1498);
        assert!(dataset.listings().iter().all(|l| l.fuel == "Diesel"));
    }

    #[test]
    fn test_missing_column_is_input_error() {
        let file = write_csv(
            "Price-$,Manufactured Year,Energy,Gearbox,Car Type,Engine Power-HP",
            &["12000,2015,Diesel,Manual,SUV,150"],
        );

        let err = load_dataset(&config_for(&file)).unwrap_err();
        match err {
            PipelineError::Input(InputError::MissingColumn { column }) => {
                assert_eq!(column, "Mileage-KM")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let config = PipelineConfig::new("/definitely/not/here.csv", ".");
        let err = load_dataset(&config).unwrap_err();
        assert!(matches!(err, PipelineError::Input(InputError::Read { .. })));
    }

    #[test]
    fn test_all_rows_filtered_is_empty_error() {
        let file = write_csv(HEADER, &["0,2015,85000,Diesel,Manual,SUV,150"]);
        let err = load_dataset(&config_for(&file)).unwrap_err();
        assert!(matches!(err, PipelineError::Input(InputError::Empty)));
    }

    #[test]
    fn test_sampling_is_capped_deterministic_and_ordered() {
        let rows: Vec<String> = (0..40)
            .map(|i| {
                format!(
                    "{},{},{},Petrol,Manual,Sedan,100",
                    5000 + i * 100,
                    2000 + i % 20,
                    10000 + i * 1000
                )
            })
            .collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let file = write_csv(HEADER, &row_refs);

        let mut config = config_for(&file);
        config.sample_cap = 10;

        let first = load_dataset(&config).unwrap();
        let second = load_dataset(&config).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        // Source prices increase monotonically, so order is preserved iff sorted.
        let prices: Vec<f64> = first.listings().iter().map(|l| l.price).collect();
        assert!(prices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_from_listings_rejects_duplicates() {
        let listing = Listing {
            price: 9000.0,
            year: 2012,
            mileage: 50000.0,
            fuel: "Petrol".to_string(),
            gearbox: "Manual".to_string(),
            car_type: "Sedan".to_string(),
            engine_hp: 95.0,
        };

        assert!(CleanedDataset::from_listings(vec![listing.clone()]).is_ok());
        assert!(CleanedDataset::from_listings(vec![listing.clone(), listing]).is_err());
        assert!(CleanedDataset::from_listings(Vec::new()).is_err());
    }
}
