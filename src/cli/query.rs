//! Query command and the constraint flags shared with `download`

use clap::Args;
use tracing::info;

use super::{print_json, CliError, Cli, OutputFormat};
use crate::constraint::{GeoConstraint, NameConstraint, TileScheme, TimeRange};
use crate::product::QueryResult;
use crate::provider::{create_adapter, AdapterContext, Provider, ProviderAdapter, QueryRequest, Session};

/// Constraint flags of a catalogue search
#[derive(Debug, Clone, Args)]
pub struct QueryArgs {
    /// Provider (cdse, creodias, cnes, theia, nasa, usgs, eumdac, google)
    #[arg(long)]
    pub provider: Provider,

    /// Generic collection name (e.g., SENTINEL-2-MSI)
    #[arg(long)]
    pub collection: String,

    /// Processing level
    #[arg(long, default_value = "1")]
    pub level: u8,

    /// Provider collection ids used verbatim instead of the reference table
    #[arg(long = "raw-collection")]
    pub raw_collections: Vec<String>,

    /// Start time (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub start: Option<String>,

    /// End time (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub end: Option<String>,

    /// Bounding box as LATMIN,LATMAX,LONMIN,LONMAX
    #[arg(long, conflicts_with_all = ["point", "tile"], allow_hyphen_values = true)]
    pub bbox: Option<String>,

    /// Point as LAT,LON
    #[arg(long, conflicts_with = "tile", allow_hyphen_values = true)]
    pub point: Option<String>,

    /// Tile code (e.g., 31TCJ)
    #[arg(long)]
    pub tile: Option<String>,

    /// Tiling grid of --tile (mgrs or venus)
    #[arg(long, default_value = "mgrs")]
    pub tile_scheme: String,

    /// Substring the product name must contain (repeatable)
    #[arg(long)]
    pub contains: Vec<String>,

    /// Prefix the product name must start with (repeatable)
    #[arg(long)]
    pub startswith: Vec<String>,

    /// Suffix the product name must end with (repeatable)
    #[arg(long)]
    pub endswith: Vec<String>,

    /// Glob the product name must match (repeatable)
    #[arg(long)]
    pub glob: Vec<String>,

    /// Maximum cloud cover in percent
    #[arg(long)]
    pub cloud_cover: Option<f64>,
}

/// Parse `n` comma-separated coordinates
fn parse_coordinates(value: &str, n: usize, flag: &str) -> Result<Vec<f64>, CliError> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CliError::InvalidArgument(format!("--{flag} '{value}': {e}")))?;
    if parts.len() != n {
        return Err(CliError::InvalidArgument(format!(
            "--{flag} expects {n} comma-separated numbers, got {}",
            parts.len()
        )));
    }
    Ok(parts)
}

impl QueryArgs {
    /// Spatial constraint selected by the flags
    pub fn geo(&self) -> Result<Option<GeoConstraint>, CliError> {
        if let Some(bbox) = &self.bbox {
            let c = parse_coordinates(bbox, 4, "bbox")?;
            return Ok(Some(GeoConstraint::bbox(c[0], c[1], c[2], c[3])?));
        }
        if let Some(point) = &self.point {
            let c = parse_coordinates(point, 2, "point")?;
            return Ok(Some(GeoConstraint::point(c[0], c[1])?));
        }
        match &self.tile {
            Some(code) => {
                let scheme: TileScheme = self.tile_scheme.parse()?;
                Ok(Some(GeoConstraint::tile(scheme, code.clone())))
            }
            None => Ok(None),
        }
    }

    /// Name constraint built from the repeatable flags
    pub fn name(&self) -> NameConstraint {
        let name = self.contains.iter().fold(NameConstraint::new(), |n, p| n.contains(p.clone()));
        let name = self.startswith.iter().fold(name, |n, p| n.startswith(p.clone()));
        let name = self.endswith.iter().fold(name, |n, p| n.endswith(p.clone()));
        self.glob.iter().fold(name, |n, p| n.glob(p.clone()))
    }

    /// Query request described by the flags
    pub fn to_request(&self) -> Result<QueryRequest, CliError> {
        let mut request = QueryRequest::new(&self.collection, self.level)
            .with_time(TimeRange::parse(self.start.as_deref(), self.end.as_deref())?)
            .with_name(self.name());
        if let Some(geo) = self.geo()? {
            request = request.with_geo(geo);
        }
        if let Some(cloud) = self.cloud_cover {
            if !(0.0..=100.0).contains(&cloud) {
                return Err(CliError::InvalidArgument(format!(
                    "--cloud-cover {cloud} is outside 0-100"
                )));
            }
            request = request.with_cloud_cover(cloud);
        }
        if !self.raw_collections.is_empty() {
            request = request.with_raw_collections(self.raw_collections.clone());
        }
        Ok(request)
    }

    /// Build the adapter, open a session and run the search
    pub async fn run(
        &self,
        context: &AdapterContext,
    ) -> Result<(Box<dyn ProviderAdapter>, Session, QueryResult), CliError> {
        let request = self.to_request()?;
        let adapter = create_adapter(self.provider, context)?;
        let session = adapter.authenticate(None).await?;
        let result = adapter.query(&session, &request).await?;
        Ok((adapter, session, result))
    }

    /// Execute the query command
    pub async fn execute(&self, cli: &Cli, context: AdapterContext) -> Result<(), CliError> {
        let (_, _, result) = self.run(&context).await?;
        info!(provider = %self.provider, count = result.len(), "Query finished");

        match cli.output_format {
            OutputFormat::Json => print_json(&result)?,
            OutputFormat::Human => {
                println!("{} products found on {}:\n", result.len(), self.provider);
                for product in result.iter() {
                    println!(
                        "{}  {}",
                        product.acquisition_date().format("%Y-%m-%d %H:%M:%S"),
                        product.product_id()
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> QueryArgs {
        QueryArgs {
            provider: Provider::Cdse,
            collection: "SENTINEL-2-MSI".to_string(),
            level: 1,
            raw_collections: Vec::new(),
            start: Some("2023-06-01".to_string()),
            end: Some("2023-06-30".to_string()),
            bbox: None,
            point: None,
            tile: None,
            tile_scheme: "mgrs".to_string(),
            contains: vec!["_T31".to_string()],
            startswith: vec!["S2A".to_string()],
            endswith: Vec::new(),
            glob: Vec::new(),
            cloud_cover: Some(20.0),
        }
    }

    #[test]
    fn test_request_from_flags() {
        let mut a = args();
        a.bbox = Some("43.0,44.0,1.0,2.5".to_string());
        let request = a.to_request().unwrap();
        assert_eq!(request.collection(), "SENTINEL-2-MSI");
        assert_eq!(request.cloud_cover(), Some(20.0));
        assert_eq!(
            request.geo(),
            Some(&GeoConstraint::bbox(43.0, 44.0, 1.0, 2.5).unwrap())
        );
        assert!(request.name().matches("S2A_MSIL1C_20230617T105031_N0509_R051_T31TCJ"));
        assert!(!request.name().matches("S2B_MSIL1C_20230617T105031_N0509_R051_T31TCJ"));
    }

    #[test]
    fn test_tile_and_point_flags() {
        let mut a = args();
        a.tile = Some("31TCJ".to_string());
        assert_eq!(a.geo().unwrap(), Some(GeoConstraint::tile(TileScheme::Mgrs, "31TCJ")));

        let mut a = args();
        a.point = Some("-8.41,119.51".to_string());
        assert_eq!(a.geo().unwrap(), Some(GeoConstraint::point(-8.41, 119.51).unwrap()));
    }

    #[test]
    fn test_invalid_flags() {
        let mut a = args();
        a.bbox = Some("43.0,44.0".to_string());
        assert!(matches!(a.geo(), Err(CliError::InvalidArgument(_))));

        let mut a = args();
        a.point = Some("95.0,10.0".to_string());
        assert!(matches!(a.geo(), Err(CliError::Constraint(_))));

        let mut a = args();
        a.cloud_cover = Some(120.0);
        assert!(a.to_request().is_err());
    }
}
