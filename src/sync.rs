use std::{fmt::Display, path::Path};

use jiff::{tz::TimeZone, Timestamp};
use log::{error, info, warn};
use tabled::{builder::Builder, settings::Style};

use crate::{
    config::Config,
    db::EnergyArchive,
    error::SyncError,
    oomi::{
        report::{archive_raw, parse_dataset},
        timestamps::{filter, normalize, provider_tz},
        AuthenticatedSession, Portal,
    },
    reading::Series,
    spot::SpotPriceClient,
};

/// How one series fared in a cycle.
#[derive(Debug)]
pub enum SeriesOutcome {
    Merged(usize),
    NoNewData,
    /// Nothing to fetch, e.g. today's prices are already stored.
    Skipped,
    Failed(SyncError),
}

impl Display for SeriesOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SeriesOutcome::*;
        match self {
            Merged(n) => write!(f, "merged {} rows", n),
            NoNewData => write!(f, "no new data"),
            Skipped => write!(f, "skipped"),
            Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(Series, SeriesOutcome)>,
}

impl CycleReport {
    pub fn outcome(&self, series: Series) -> Option<&SeriesOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == series)
            .map(|(_, o)| o)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SeriesOutcome::Failed(_)))
            .count()
    }

    pub fn summary_table(&self) -> tabled::Table {
        let mut builder = Builder::new();
        builder.push_record(vec!["Series", "Outcome"]);
        for (series, outcome) in &self.outcomes {
            builder.push_record(vec![series.to_string(), outcome.to_string()]);
        }
        let mut table = builder.build();
        table.with(Style::sharp());
        table
    }
}

/// Runs sync cycles against one store.  Nothing is cached between
/// cycles: every cycle logs in again and reads the watermarks fresh.
pub struct Syncer {
    config: Config,
    store: EnergyArchive,
    portal: Portal,
    spot: SpotPriceClient,
    tz: TimeZone,
}

impl Syncer {
    pub fn new(config: Config, store: EnergyArchive) -> Result<Syncer, SyncError> {
        let portal = Portal::new(&config.portal_url);
        let spot = SpotPriceClient::new(&config.spot_price_url)?;
        Ok(Syncer {
            config,
            store,
            portal,
            spot,
            tz: provider_tz()?,
        })
    }

    pub fn store(&self) -> &EnergyArchive {
        &self.store
    }

    /// One full cycle: log in, then consumption, production and spot
    /// prices in that order.  A failed login fails the whole cycle, any
    /// other failure only affects its own series.
    pub fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        self.run_cycle_at(Timestamp::now())
    }

    pub fn run_cycle_at(&mut self, now: Timestamp) -> Result<CycleReport, SyncError> {
        info!("Running syncs");
        let session = self
            .portal
            .login(&self.config.username, &self.config.password)?;

        let mut report = CycleReport::default();
        let metered = [
            (
                Series::Consumption,
                self.config.metering_point_consumption.clone(),
            ),
            (
                Series::Production,
                self.config.metering_point_production.clone(),
            ),
        ];
        for (series, metering_point) in metered {
            let outcome = match self.sync_metered(&session, series, &metering_point, None, now) {
                Ok(0) => {
                    info!("No new {} data", series);
                    SeriesOutcome::NoNewData
                }
                Ok(n) => SeriesOutcome::Merged(n),
                Err(e) => {
                    error!("Syncing {} failed: {}", series, e);
                    SeriesOutcome::Failed(e)
                }
            };
            report.outcomes.push((series, outcome));
        }

        let outcome = match self.sync_spot_prices(now) {
            Ok(Some(0)) => SeriesOutcome::NoNewData,
            Ok(Some(n)) => SeriesOutcome::Merged(n),
            Ok(None) => SeriesOutcome::Skipped,
            Err(e) => {
                error!("Syncing spot prices failed: {}", e);
                SeriesOutcome::Failed(e)
            }
        };
        report.outcomes.push((Series::SpotPrice, outcome));
        Ok(report)
    }

    /// Fetch a metered series past its watermark and merge it.  Returns the
    /// number of rows merged.
    pub fn sync_metered(
        &mut self,
        session: &AuthenticatedSession,
        series: Series,
        metering_point: &str,
        up_to: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<usize, SyncError> {
        let watermark = self.store.watermark(series)?;
        info!("Latest {} date: {:?}", series, watermark);

        let html = session.fetch_report(metering_point)?;
        let dataset = parse_dataset(&html)?;
        if let Some(dir) = &self.config.archive_dir {
            self.archive(dir, metering_point, dataset.raw, now);
        }
        let readings = normalize(&dataset.pairs, &self.tz)?;
        let readings = filter(readings, watermark, up_to, &self.tz);
        self.store.merge(series, &readings)
    }

    /// Merge today's spot prices unless prices past `now` are stored
    /// already.  Returns `None` when skipped.
    pub fn sync_spot_prices(&mut self, now: Timestamp) -> Result<Option<usize>, SyncError> {
        let latest = match self.store.watermark(Series::SpotPrice) {
            Ok(latest) => latest,
            Err(e) => {
                error!("Error getting latest spot price: {}", e);
                None
            }
        };
        info!("Latest spot price in db: {:?}", latest);
        if latest.is_some_and(|t| t > now) {
            info!("No new spot prices");
            return Ok(None);
        }
        let prices = self.spot.fetch_today()?;
        self.store.merge(Series::SpotPrice, &prices).map(Some)
    }

    fn archive(&self, dir: &Path, metering_point: &str, raw: &str, now: Timestamp) {
        match archive_raw(dir, metering_point, raw, now) {
            Ok(path) => info!("Archived raw data to {:?}", path),
            Err(e) => warn!("Failed to archive raw data for {}: {}", metering_point, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use mockito::{Matcher, Mock, Server};

    use super::*;
    use crate::reading::Reading;

    const SPOT_TODAY: &str = r#"[
  {"DateTime":"2023-05-02T00:00:00+03:00","PriceWithTax":0.0512},
  {"DateTime":"2023-05-02T01:00:00+03:00","PriceWithTax":0.0431}
]"#;

    fn config(server: &Server) -> Config {
        Config {
            username: "test_user".to_string(),
            password: "test_password".to_string(),
            metering_point_consumption: "MP_CONS".to_string(),
            metering_point_production: "MP_PROD".to_string(),
            duckdb_path: ":memory:".to_string(),
            portal_url: server.url(),
            spot_price_url: format!("{}/Today", server.url()),
            interval: Duration::from_secs(3600),
            archive_dir: None,
        }
    }

    fn mock_login(server: &mut Server) -> Mock {
        server
            .mock("GET", "/eServices/Online/IndexNoAuth")
            .with_status(200)
            .with_body(r#"<input name="__RequestVerificationToken" type="hidden" value="tok" />"#)
            .create();
        server
            .mock("POST", "/eServices/Online/Login")
            .with_status(200)
            .with_body(r#"var userName = "test_user";"#)
            .create()
    }

    fn mock_report(server: &mut Server, metering_point: &str, status: usize, body: &str) -> Mock {
        server
            .mock("GET", "/Reporting/CustomerConsumption")
            .match_query(Matcher::UrlEncoded(
                "meteringPointCode".into(),
                metering_point.into(),
            ))
            .with_status(status)
            .with_body(body)
            .create()
    }

    fn init_log() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
    }

    #[test]
    fn empty_store_one_reading() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        mock_report(
            &mut server,
            "MP_CONS",
            200,
            r#"var model = {"Data":[[1682985600000,10.0]]};"#,
        );
        mock_report(&mut server, "MP_PROD", 200, r#"var model = {"Data":[]};"#);
        server
            .mock("GET", "/Today")
            .with_status(200)
            .with_body(SPOT_TODAY)
            .create();

        let mut syncer = Syncer::new(config(&server), EnergyArchive::open_in_memory()?)?;
        assert_eq!(syncer.store().watermark(Series::Consumption)?, None);

        let now: Timestamp = "2023-05-01T12:00:00Z".parse()?;
        let report = syncer.run_cycle_at(now)?;
        println!("{}", report.summary_table());

        let t: Timestamp = "2023-05-01T21:00:00Z".parse()?;
        assert!(matches!(
            report.outcome(Series::Consumption),
            Some(SeriesOutcome::Merged(1))
        ));
        assert!(matches!(
            report.outcome(Series::Production),
            Some(SeriesOutcome::NoNewData)
        ));
        assert!(matches!(
            report.outcome(Series::SpotPrice),
            Some(SeriesOutcome::Merged(2))
        ));
        assert_eq!(
            syncer.store().readings(Series::Consumption, None)?,
            vec![Reading::new(t, 10.0)]
        );
        assert_eq!(syncer.store().watermark(Series::Consumption)?, Some(t));
        assert_eq!(report.failures(), 0);
        Ok(())
    }

    #[test]
    fn second_cycle_only_merges_newer_readings() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        mock_report(
            &mut server,
            "MP_CONS",
            200,
            r#"var model = {"Data":[[1682985600000,10.0],[1682989200000,20.0]]};"#,
        );
        mock_report(&mut server, "MP_PROD", 200, r#"var model = {"Data":[]};"#);
        server
            .mock("GET", "/Today")
            .with_status(200)
            .with_body(SPOT_TODAY)
            .create();

        let mut store = EnergyArchive::open_in_memory()?;
        let t0: Timestamp = "2023-05-01T21:00:00Z".parse()?;
        store.merge(Series::Consumption, &[Reading::new(t0, 99.0)])?;

        let mut syncer = Syncer::new(config(&server), store)?;
        let report = syncer.run_cycle_at("2023-05-01T12:00:00Z".parse()?)?;
        assert!(matches!(
            report.outcome(Series::Consumption),
            Some(SeriesOutcome::Merged(1))
        ));
        // the reading at the watermark is not fetched again
        assert_eq!(
            syncer.store().readings(Series::Consumption, None)?,
            vec![
                Reading::new(t0, 99.0),
                Reading::new("2023-05-01T22:00:00Z".parse()?, 20.0)
            ]
        );
        Ok(())
    }

    #[test]
    fn failed_series_does_not_stop_the_others() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        mock_report(&mut server, "MP_CONS", 500, "");
        let production = mock_report(
            &mut server,
            "MP_PROD",
            200,
            r#"var model = {"Data":[[1682985600000,1.5]]};"#,
        );
        server.mock("GET", "/Today").with_status(200).with_body("oops").create();

        let mut syncer = Syncer::new(config(&server), EnergyArchive::open_in_memory()?)?;
        let report = syncer.run_cycle_at("2023-05-01T12:00:00Z".parse()?)?;
        assert!(matches!(
            report.outcome(Series::Consumption),
            Some(SeriesOutcome::Failed(SyncError::Fetch { .. }))
        ));
        assert!(matches!(
            report.outcome(Series::Production),
            Some(SeriesOutcome::Merged(1))
        ));
        assert!(matches!(
            report.outcome(Series::SpotPrice),
            Some(SeriesOutcome::Failed(SyncError::Parse(_)))
        ));
        assert_eq!(report.failures(), 2);
        assert_eq!(syncer.store().count(Series::Consumption)?, 0);
        production.assert();
        Ok(())
    }

    #[test]
    fn store_failure_only_fails_its_series() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        let consumption = server
            .mock("GET", "/Reporting/CustomerConsumption")
            .match_query(Matcher::UrlEncoded(
                "meteringPointCode".into(),
                "MP_CONS".into(),
            ))
            .expect(0)
            .create();
        mock_report(
            &mut server,
            "MP_PROD",
            200,
            r#"var model = {"Data":[[1682985600000,1.5]]};"#,
        );
        server
            .mock("GET", "/Today")
            .with_status(200)
            .with_body(SPOT_TODAY)
            .create();

        let mut syncer = Syncer::new(config(&server), EnergyArchive::open_in_memory()?)?;
        syncer
            .store()
            .connection()
            .execute_batch("DROP TABLE energy_consumption;")?;
        let report = syncer.run_cycle_at("2023-05-01T12:00:00Z".parse()?)?;
        assert!(matches!(
            report.outcome(Series::Consumption),
            Some(SeriesOutcome::Failed(SyncError::Persistence(_)))
        ));
        assert!(matches!(
            report.outcome(Series::Production),
            Some(SeriesOutcome::Merged(1))
        ));
        assert!(matches!(
            report.outcome(Series::SpotPrice),
            Some(SeriesOutcome::Merged(2))
        ));
        assert_eq!(report.failures(), 1);
        assert_eq!(syncer.store().count(Series::Production)?, 1);
        assert_eq!(syncer.store().count(Series::SpotPrice)?, 2);
        consumption.assert();
        Ok(())
    }

    #[test]
    fn failed_login_fails_the_cycle() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        server
            .mock("GET", "/eServices/Online/IndexNoAuth")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create();
        let report = server
            .mock("GET", "/Reporting/CustomerConsumption")
            .match_query(Matcher::Any)
            .expect(0)
            .create();

        let mut syncer = Syncer::new(config(&server), EnergyArchive::open_in_memory()?)?;
        let res = syncer.run_cycle_at("2023-05-01T12:00:00Z".parse()?);
        assert!(matches!(res, Err(SyncError::Authentication(_))));
        report.assert();
        Ok(())
    }

    #[test]
    fn spot_prices_skipped_when_future_prices_stored() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        let spot = server.mock("GET", "/Today").expect(0).create();

        let mut store = EnergyArchive::open_in_memory()?;
        store.merge(
            Series::SpotPrice,
            &[Reading::new("2023-05-01T22:00:00Z".parse()?, 0.05)],
        )?;
        let mut syncer = Syncer::new(config(&server), store)?;
        assert_eq!(
            syncer.sync_spot_prices("2023-05-01T12:00:00Z".parse()?)?,
            None
        );
        spot.assert();
        Ok(())
    }

    #[test]
    fn up_to_bounds_the_merge() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        mock_report(
            &mut server,
            "MP_CONS",
            200,
            r#"var model = {"Data":[[1682985600000,10.0],[1682989200000,20.0]]};"#,
        );
        let mut syncer = Syncer::new(config(&server), EnergyArchive::open_in_memory()?)?;
        let session = Portal::new(&server.url()).login("test_user", "test_password")?;
        let t0: Timestamp = "2023-05-01T21:00:00Z".parse()?;
        let n = syncer.sync_metered(
            &session,
            Series::Consumption,
            "MP_CONS",
            Some(t0),
            "2023-05-01T12:00:00Z".parse()?,
        )?;
        assert_eq!(n, 1);
        assert_eq!(syncer.store().watermark(Series::Consumption)?, Some(t0));
        Ok(())
    }

    #[test]
    fn raw_dataset_archived() -> Result<(), Box<dyn Error>> {
        init_log();
        let mut server = Server::new();
        mock_login(&mut server);
        mock_report(
            &mut server,
            "MP_CONS",
            200,
            r#"var model = {"Data":[[1682985600000,10.0]]};"#,
        );
        let dir = std::env::temp_dir().join(format!("oomi-sync-cycle-{}", std::process::id()));
        let mut config = config(&server);
        config.archive_dir = Some(dir.clone());

        let mut syncer = Syncer::new(config, EnergyArchive::open_in_memory()?)?;
        let session = Portal::new(&server.url()).login("test_user", "test_password")?;
        let now: Timestamp = "2023-05-01T12:00:00Z".parse()?;
        syncer.sync_metered(&session, Series::Consumption, "MP_CONS", None, now)?;
        assert!(dir
            .join("Raw/2023/MP_CONS_20230501T120000Z.json.gz")
            .exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
