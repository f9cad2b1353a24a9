use anyhow::{Context, Result, bail};
use metattr::{
    BatchDownloader, CredentialConfig, CredentialManager, Crs, Pipeline, RasterBatch,
    RasterRequest, RequestStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CLIMATE_VARIABLES: [&str; 8] = [
    "groundfrost",
    "hurs",
    "psl",
    "pv",
    "sfcWind",
    "sun",
    "tas",
    "rainfall",
];

const YEARS: [&str; 4] = ["2016", "2017", "2018", "2019"];

// `{var}` and `{year}` are substituted. The readers take GeoTIFF, so point this
// at GeoTIFF copies of the monthly grids.
const DEFAULT_TEMPLATE: &str = "https://dap.ceda.ac.uk/badc/ukmo-hadobs/data/insitu/MOHC/HadOBS/HadUK-Grid/v1.0.2.1/1km/{var}/mon/v20200731/{var}_hadukgrid_uk_1km_mon_{year}01-{year}12.tif";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Example program that calls the library API:
    // attribute_points <username> <password> <points.csv> <folder> [url template]
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        bail!("usage: attribute_points <username> <password> <points.csv> <folder> [url template]");
    }
    let points = PathBuf::from(&args[2]);
    let folder = PathBuf::from(&args[3]);
    let template = args.get(4).map(String::as_str).unwrap_or(DEFAULT_TEMPLATE);

    let config = CredentialConfig::load(Some(args[0].clone()), Some(args[1].clone()))?;
    let credentials = Arc::new(CredentialManager::new(config)?);
    if credentials.ensure(std::time::Duration::from_secs(600))? {
        println!("security credentials set up");
    }

    let pipeline = Pipeline::new(BatchDownloader::new(credentials), &folder)
        .with_crs(Some(Crs::epsg(27700)?), Some(Crs::epsg(4326)?));

    let batches: Vec<RasterBatch> = YEARS
        .iter()
        .map(|year| RasterBatch {
            label: year.to_string(),
            requests: CLIMATE_VARIABLES
                .iter()
                .map(|var| {
                    RasterRequest::new(
                        *var,
                        template.replace("{var}", var).replace("{year}", year),
                    )
                })
                .collect(),
        })
        .collect();

    let report = pipeline
        .run(&points, &points, &batches)
        .with_context(|| format!("attributing {}", points.display()))?;

    for outcome in &report.outcomes {
        match &outcome.status {
            RequestStatus::Merged { columns } => {
                println!("{} {}: {} columns", outcome.label, outcome.variable, columns.len())
            }
            RequestStatus::Failed { error } => {
                println!("{} {}: FAILED {}", outcome.label, outcome.variable, error)
            }
        }
    }
    Ok(())
}
