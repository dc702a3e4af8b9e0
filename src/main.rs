use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local};

use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

use strata::config::StoreConfig;
use strata::container::MemoryContainerStore;
use strata::digest::ImageId;
use strata::events::LogEvents;
use strata::helpers::{edit_key_value, DataSize, TablePrinter};
use strata::image_store::NoLeases;
use strata::reference::ImageTag;
use strata::service::{ImageDeleteResponse, ImageService};

#[derive(Debug, StructOpt)]
#[structopt(name="strata", about="Content-addressed image and layer store")]
enum CommandLineInput {
    #[structopt(about="Lists the images")]
    #[structopt(name="images")]
    ListImages {

    },
    #[structopt(about="Lists the registered layers")]
    #[structopt(name="layers")]
    ListLayers {

    },
    #[structopt(about="Creates an image from a tar archive")]
    #[structopt(name="import")]
    Import {
        #[structopt(name="file", help="The uncompressed tar archive with the changes")]
        file: PathBuf,
        #[structopt(long, help="The image to stack the changes on")]
        parent: Option<String>,
        #[structopt(long, help="The tag of the new image")]
        tag: Option<ImageTag>,
        #[structopt(long, help="Comment stored in the image history")]
        comment: Option<String>
    },
    #[structopt(about="Tags an image")]
    #[structopt(name="tag")]
    TagImage {
        #[structopt(name="reference", help="The source image")]
        reference: String,
        #[structopt(name="tag", help="The new tag for the image")]
        tag: ImageTag
    },
    #[structopt(about="Removes an image")]
    #[structopt(name="rmi")]
    RemoveImage {
        #[structopt(name="reference", help="The image to remove")]
        reference: String,
        #[structopt(long, help="Removes the image even if it has children or all its names")]
        force: bool,
        #[structopt(long, help="Keeps untagged parents")]
        no_prune: bool
    },
    #[structopt(about="Removes images without names, children or containers")]
    #[structopt(name="prune")]
    Prune {

    },
    #[structopt(about="Shows the space used by images")]
    #[structopt(name="disk-usage")]
    DiskUsage {

    },
    #[structopt(about="Manages the configuration")]
    Config {
        #[structopt(long, help="Sets a configuration value (key=value)")]
        edit: Option<String>
    }
}

fn setup_logger(level: log::LevelFilter) -> Result<(), String> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %T%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .map_err(|err| format!("{}", err))
}

fn create_image_service(config: &StoreConfig) -> Result<ImageService, String> {
    ImageService::open(
        config,
        std::sync::Arc::new(MemoryContainerStore::new()),
        LogEvents::new(),
        NoLeases::new()
    ).map_err(|err| format!("{}", err))
}

fn short_id(id: &ImageId) -> String {
    id.digest().hex().chars().take(12).collect()
}

fn format_created(created: Option<DateTime<chrono::Utc>>) -> String {
    match created {
        Some(created) => {
            let created: DateTime<Local> = created.into();
            created.format("%Y-%m-%d %T").to_string()
        }
        None => "N/A".to_owned()
    }
}

fn print_config(config: &StoreConfig) {
    println!("base_folder: {}", config.base_folder.display());
    println!("max_concurrent_downloads: {}", config.max_concurrent_downloads);
    println!("max_concurrent_uploads: {}", config.max_concurrent_uploads);
    println!("max_download_attempts: {}", config.max_download_attempts);
    println!("download_retry_delay: {}", config.download_retry_delay);
    println!("log_level: {}", config.log_level);
}

fn edit_config(config: &StoreConfig, edit: &str) -> Result<StoreConfig, String> {
    fn parse<T: FromStr>(key: &str, value: Option<&str>) -> Result<T, String> {
        let value = value.ok_or_else(|| format!("Expected a value for '{}'", key))?;
        T::from_str(value).map_err(|_| format!("Invalid value '{}' for '{}'", value, key))
    }

    let (key, value) = edit_key_value(edit)?;

    let mut new_config = config.clone();
    match key {
        "base_folder" => {
            new_config.base_folder = value.map(PathBuf::from).ok_or_else(|| "Expected a value for 'base_folder'".to_owned())?;
        }
        "max_concurrent_downloads" => {
            new_config.max_concurrent_downloads = parse(key, value)?;
        }
        "max_concurrent_uploads" => {
            new_config.max_concurrent_uploads = parse(key, value)?;
        }
        "max_download_attempts" => {
            new_config.max_download_attempts = parse(key, value)?;
        }
        "download_retry_delay" => {
            new_config.download_retry_delay = parse(key, value)?;
        }
        "log_level" => {
            let level: log::LevelFilter = parse(key, value)?;
            new_config.log_level = level.to_string().to_lowercase();
        }
        _ => {
            return Err(format!("Invalid key '{}'", key));
        }
    }

    new_config.validate()?;
    Ok(new_config)
}

fn main_run(config: StoreConfig, command_line_input: CommandLineInput) -> Result<(), String> {
    match command_line_input {
        CommandLineInput::ListImages {} => {
            let image_service = create_image_service(&config)?;

            let mut table_printer = TablePrinter::new(
                vec![
                    "REPOSITORY".to_owned(),
                    "TAG".to_owned(),
                    "IMAGE ID".to_owned(),
                    "CREATED".to_owned(),
                    "SIZE".to_owned()
                ]
            );

            for image in image_service.list_images() {
                let names = if image.references.is_empty() {
                    vec![("<none>".to_owned(), "<none>".to_owned())]
                } else {
                    image.references
                        .iter()
                        .map(|name| {
                            (
                                name.full_repository(),
                                name.image_tag().map(|tag| tag.tag().to_owned()).unwrap_or_else(|| "<none>".to_owned())
                            )
                        })
                        .collect()
                };

                for (repository, tag) in names {
                    table_printer.add_row(vec![
                        repository,
                        tag,
                        short_id(&image.id),
                        format_created(image.created),
                        DataSize(image.size).to_string()
                    ]);
                }
            }

            table_printer.print();
        }
        CommandLineInput::ListLayers {} => {
            let image_service = create_image_service(&config)?;
            let layer_store = image_service.layer_store();

            let mut table_printer = TablePrinter::new(
                vec![
                    "CHAIN ID".to_owned(),
                    "DIFF ID".to_owned(),
                    "PARENT".to_owned(),
                    "REFERENCES".to_owned(),
                    "SIZE".to_owned()
                ]
            );

            let mut layers = layer_store.map().into_values().collect::<Vec<_>>();
            layers.sort_by_key(|layer| layer.created());

            for layer in layers {
                table_printer.add_row(vec![
                    layer.chain_id().short().to_owned(),
                    layer.diff_id().short().to_owned(),
                    layer.parent().map(|parent| parent.short().to_owned()).unwrap_or_else(|| "N/A".to_owned()),
                    layer_store.references(layer.chain_id()).unwrap_or(0).to_string(),
                    DataSize(layer.diff_size()).to_string()
                ]);
            }

            println!("Driver: {}", layer_store.driver_name());
            for (key, value) in layer_store.driver_status() {
                println!("{}: {}", key, value);
            }
            println!();
            table_printer.print();
        }
        CommandLineInput::Import { file, parent, tag, comment } => {
            let image_service = create_image_service(&config)?;

            let parent = match parent {
                Some(parent) => Some(image_service.resolve_image(&parent).map_err(|err| format!("{}", err))?),
                None => None
            };

            let diff = std::fs::File::open(&file).map_err(|err| format!("Failed to open {}: {}", file.display(), err))?;
            let id = image_service.import_image(std::io::BufReader::new(diff), parent.as_ref(), comment).map_err(|err| format!("{}", err))?;

            if let Some(tag) = tag {
                image_service.tag_image(id.as_str(), &tag).map_err(|err| format!("{}", err))?;
                println!("Imported {} as {}", id, tag);
            } else {
                println!("Imported {}", id);
            }
        }
        CommandLineInput::TagImage { reference, tag } => {
            let image_service = create_image_service(&config)?;

            let id = image_service.tag_image(&reference, &tag).map_err(|err| format!("{}", err))?;
            println!("Tagged {} ({}) as {}", reference, short_id(&id), tag);
        }
        CommandLineInput::RemoveImage { reference, force, no_prune } => {
            let image_service = create_image_service(&config)?;

            let responses = image_service.image_delete(&reference, force, !no_prune).map_err(|err| format!("{}", err))?;
            for response in responses {
                match response {
                    ImageDeleteResponse::Untagged(name) => println!("Untagged: {}", name),
                    ImageDeleteResponse::Deleted(id) => println!("Deleted: {}", id)
                }
            }
        }
        CommandLineInput::Prune {} => {
            let image_service = create_image_service(&config)?;

            let report = image_service.prune_images(&CancellationToken::new()).map_err(|err| format!("{}", err))?;
            for id in &report.deleted {
                println!("Deleted: {}", id);
            }
            println!("Total reclaimed space: {}", DataSize(report.space_reclaimed));
        }
        CommandLineInput::DiskUsage {} => {
            let image_service = create_image_service(&config)?;

            let size = image_service.image_disk_usage(&CancellationToken::new()).map_err(|err| format!("{}", err))?;
            println!("Images: {}", image_service.count_images());
            println!("Layers: {}", image_service.layer_store().len());
            println!("Size: {}", DataSize(size));
        }
        CommandLineInput::Config { edit } => {
            if let Some(edit) = edit {
                let new_config = edit_config(&config, &edit)?;

                let config_file = get_config_file()?;
                if let Some(parent) = config_file.parent() {
                    std::fs::create_dir_all(parent).map_err(|err| format!("{}", err))?;
                }
                new_config.save_to_file(&config_file)?;

                println!("New config:");
                print_config(&new_config);
            } else {
                print_config(&config);
            }
        }
    }

    Ok(())
}

fn main() {
    let config = get_config_file()
        .and_then(|path| StoreConfig::load_from_file(&path))
        .unwrap_or_default();
    let command_line_input = CommandLineInput::from_args();

    if let Err(err) = setup_logger(config.log_level()) {
        eprintln!("Failed to set up logging: {}", err);
    }

    if let Err(err) = main_run(config, command_line_input) {
        println!("{}", err);
        std::process::exit(1);
    }
}

fn get_config_file() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|home| home.join(".strata").join("config.toml"))
        .ok_or_else(|| "Could not determine the home folder".to_owned())
}
