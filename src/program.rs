use std::env::current_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use tracing::{error, info, trace};

use dataset_wrangler::config::{AppConfig, ConfigManager};
use dataset_wrangler::dataset::export::{export_project, list_projects};
use dataset_wrangler::dataset::flickr::{BoundingBox, FlickrClient, FlickrDownloader, SearchQuery};
use dataset_wrangler::dataset::{BulkDownloader, HttpTransport, JobSource, Transport};

use crate::progress::{download_bar, progress_hook};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main menu options
#[derive(Debug, Clone, Copy)]
enum MainMenuOption {
    DownloadFromFile,
    DownloadFromFlickr,
    ExportProject,
    Exit,
}

impl MainMenuOption {
    fn variants() -> &'static [MainMenuOption] {
        &[
            MainMenuOption::DownloadFromFile,
            MainMenuOption::DownloadFromFlickr,
            MainMenuOption::ExportProject,
            MainMenuOption::Exit,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::DownloadFromFile => "Download images from a csv or txt file",
            MainMenuOption::DownloadFromFlickr => "Download images from a Flickr search",
            MainMenuOption::ExportProject => "Export a labeling project",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// A program class that handles the flow of the dataset user experience and steps of execution.
pub(crate) struct Program {
    config_manager: ConfigManager,
    config: AppConfig,
    transport: Arc<dyn Transport>,
    theme: ColorfulTheme,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.get_app_config();
        let transport = HttpTransport::new(config.network.timeout_secs, &config.network.user_agent)
            .context("Failed to build the HTTP client")?;

        Ok(Self {
            config_manager,
            config,
            transport: Arc::new(transport),
            theme: ColorfulTheme::default(),
        })
    }

    /// Runs the menu until the user exits.
    pub(crate) async fn run(mut self) -> Result<()> {
        Term::stdout().set_title("dataset wrangler");
        trace!("Starting dataset wrangler...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());
        trace!("Config File: {}", self.config_manager.path().display());

        loop {
            let options = MainMenuOption::variants();
            let names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

            println!("\n{}", style("Dataset Wrangler - Main Menu").cyan().bold());
            let selection = Select::with_theme(&self.theme)
                .items(&names)
                .default(0)
                .interact()?;

            // A failed run returns to the menu
            let result = match options[selection] {
                MainMenuOption::DownloadFromFile => self.download_from_file().await,
                MainMenuOption::DownloadFromFlickr => self.download_from_flickr().await,
                MainMenuOption::ExportProject => self.export_project().await,
                MainMenuOption::Exit => {
                    println!("{}", style("Exiting...").cyan());
                    break;
                }
            };

            if let Err(e) = result {
                error!("{:#}", e);
                println!("{} {:#}", style("Error:").red().bold(), e);
            }
        }

        Ok(())
    }

    fn download_root(&self) -> PathBuf {
        PathBuf::from(&self.config.paths.download_directory)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.timeout_secs)
    }

    fn prompt_path(&self, prompt: &str, default: &Path) -> Result<PathBuf> {
        let input: String = Input::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default.display().to_string())
            .interact_text()?;
        Ok(PathBuf::from(input.trim()))
    }

    fn prompt_optional(&self, prompt: &str) -> Result<Option<String>> {
        let input: String = Input::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?;
        let input = input.trim();
        Ok((!input.is_empty()).then(|| input.to_string()))
    }

    async fn download_from_file(&self) -> Result<()> {
        let input: String = Input::with_theme(&self.theme)
            .with_prompt("Path to a .csv or .txt file of image URLs")
            .interact_text()?;
        let path = PathBuf::from(input.trim());

        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let (url_col, label_col) = if is_csv {
            let url_col: String = Input::with_theme(&self.theme)
                .with_prompt("URL column")
                .default("url".to_string())
                .interact_text()?;
            (Some(url_col), self.prompt_optional("Label column (optional)")?)
        } else {
            (None, None)
        };

        let source = JobSource::open(&path, url_col.as_deref(), label_col.as_deref())?;
        let destination = self.prompt_path("Destination directory", &source.default_destination())?;

        let bar = download_bar("Downloading");
        let started = Instant::now();
        let report = BulkDownloader::new(self.transport.clone())
            .with_workers(self.config.pools.max_download_concurrency)
            .with_timeout(self.timeout())
            .download(&source, &destination, progress_hook(&bar))
            .await;
        bar.finish_and_clear();
        let report = report?;

        println!(
            "{} {} of {} images in {:.1?}",
            style("Downloaded").green().bold(),
            report.succeeded,
            report.total,
            started.elapsed()
        );
        if let Some(errors) = &report.error_report {
            println!("{} {} failed, see {}", style("Warning:").yellow(), report.failed(), errors.display());
        }
        Ok(())
    }

    fn flickr_api_key(&mut self) -> Result<String> {
        if self.config.has_flickr_api_key() {
            return Ok(self.config.flickr.api_key.clone());
        }

        let key: String = Input::with_theme(&self.theme)
            .with_prompt("Flickr API key")
            .interact_text()?;
        let key = key.trim().to_string();
        if key.is_empty() {
            bail!("A Flickr API key is required");
        }

        let save = Confirm::with_theme(&self.theme)
            .with_prompt(format!("Save the key to {}?", self.config_manager.path().display()))
            .default(true)
            .interact()?;
        self.config.flickr.api_key = key.clone();
        if save {
            self.config_manager.save_app_config(&self.config)?;
            info!("Saved Flickr API key");
        }
        Ok(key)
    }

    async fn download_from_flickr(&mut self) -> Result<()> {
        let api_key = self.flickr_api_key()?;

        let bbox = self
            .prompt_optional("Bounding box min_lat,min_long,max_lat,max_long (optional)")?
            .map(|b| BoundingBox::parse(&b))
            .transpose()?;
        let text = self.prompt_optional("Search text (optional)")?;
        if bbox.is_none() && text.is_none() {
            bail!("Give a bounding box, search text, or both");
        }
        let query = SearchQuery { bbox, text };

        let destination = self.prompt_path("Destination directory", &self.download_root().join("flickr"))?;

        let flickr = &self.config.flickr;
        let client = FlickrClient::new(self.transport.clone(), api_key)
            .with_base_url(&flickr.base_url)
            .with_per_page(flickr.per_page);
        let downloader = FlickrDownloader::new(client, self.transport.clone())
            .with_size(&flickr.size)
            .with_workers(self.config.pools.max_download_concurrency)
            .with_search_concurrency(self.config.pools.max_search_concurrency)
            .with_timeout(self.timeout());

        let bar = download_bar("Flickr");
        let started = Instant::now();
        let summary = downloader
            .download(&query, &destination, progress_hook(&bar))
            .await;
        bar.finish_and_clear();
        let summary = summary?;

        println!(
            "{} {} images in {:.1?}",
            style("Downloaded").green().bold(),
            summary.downloaded,
            started.elapsed()
        );
        println!(
            "Search errors: {} | Duplicates: {} | Download errors: {} | Found {} images",
            summary.search_errors, summary.duplicates, summary.download_errors, summary.found
        );
        Ok(())
    }

    async fn export_project(&self) -> Result<()> {
        let projects_dir = match self.config.projects_directory() {
            Some(dir) if dir.is_dir() => dir,
            _ => self.prompt_path("Projects directory", Path::new("."))?,
        };

        let projects = list_projects(&projects_dir)
            .with_context(|| format!("Failed to list projects in {}", projects_dir.display()))?;
        if projects.is_empty() {
            bail!("No projects found in {}", projects_dir.display());
        }

        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        let selection = Select::with_theme(&self.theme)
            .with_prompt("Project")
            .items(&names)
            .default(0)
            .interact()?;
        let project = &projects[selection];

        let destination = self.prompt_path("Destination directory", &self.download_root().join(&project.name))?;

        let bar = download_bar("Exporting");
        let summary = export_project(
            &projects_dir,
            &project.id,
            &destination,
            self.config.pools.max_download_concurrency,
            progress_hook(&bar),
        )
        .await;
        bar.finish_and_clear();
        let summary = summary?;

        println!(
            "{} {} of {} images to {}",
            style("Exported").green().bold(),
            summary.exported,
            summary.total,
            destination.display()
        );
        Ok(())
    }
}
