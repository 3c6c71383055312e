use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use disk_image_builder::builder::DiskBuilder;
use disk_image_builder::config::ImageConfiguration;
use disk_image_builder::defaults::RESULT_FILE_NAME;
use disk_image_builder::firmware::Firmware;
use disk_image_builder::preflight::{check_host_tools, require_root};
use disk_image_builder::system::BuildResult;

fn usage() -> &'static str {
    "Usage:\n  disk-image-builder build <config.toml> <root_dir> <target_dir>\n  disk-image-builder check <config.toml>\n  disk-image-builder results <target_dir>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [build, config, root_dir, target_dir] if build == "build" => build_disk(
            Path::new(config),
            Path::new(root_dir),
            Path::new(target_dir),
        ),
        [check, config] if check == "check" => check_config(Path::new(config)),
        [results, target_dir] if results == "results" => show_results(Path::new(target_dir)),
        _ => bail!(usage()),
    }
}

fn load_config(path: &Path) -> Result<ImageConfiguration> {
    let config = ImageConfiguration::load(path)
        .with_context(|| format!("loading image configuration '{}'", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating image configuration '{}'", path.display()))?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let firmware = Firmware::new(&config).context("resolving firmware")?;
    check_host_tools(&config, &firmware).context("checking host tools")?;
    println!(
        "{}: {} disk, {:?} partition table",
        config.image_stem(),
        config.filesystem,
        firmware.partition_table_type()
    );
    Ok(())
}

fn build_disk(config_path: &Path, root_dir: &Path, target_dir: &Path) -> Result<()> {
    require_root().context("disk builds need root privileges")?;
    let config = load_config(config_path)?;
    let firmware = Firmware::new(&config).context("resolving firmware")?;
    check_host_tools(&config, &firmware).context("checking host tools")?;

    let mut builder = DiskBuilder::new(config, root_dir, target_dir)
        .context("setting up disk builder")?;
    let mut result = builder
        .create_disk()
        .with_context(|| format!("building disk '{}'", builder.diskname().display()))?;
    builder
        .create_install_media(&mut result)
        .context("building installation media")?;
    builder
        .create_disk_format(&mut result)
        .context("converting disk format")?;

    result.write_checksums().context("writing checksums")?;
    let result_file = result_path(target_dir);
    result
        .dump(&result_file)
        .with_context(|| format!("writing '{}'", result_file.display()))?;
    result.print_results();
    Ok(())
}

fn show_results(target_dir: &Path) -> Result<()> {
    let result_file = result_path(target_dir);
    let result = BuildResult::load(&result_file)
        .with_context(|| format!("reading '{}'", result_file.display()))?;
    result.print_results();
    Ok(())
}

fn result_path(target_dir: &Path) -> PathBuf {
    target_dir.join(RESULT_FILE_NAME)
}
