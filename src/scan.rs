//! Scan driven configuration loading.
//!
//! Maps a scanned device identification to the matching CSV definition
//! files and loads them into the catalog. The file access is abstracted
//! so the same resolution algorithm runs against the local filesystem
//! or a configuration web service.

use crate::{bushandler::BusHandler, Result};
use ebus::{
    extract_defaults_from_filename, filereader, Error, FieldTemplates, FilenameDefaults,
    MessageCatalog, OutputFormat,
};
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

/// File name of the template definitions within a directory.
pub const TEMPLATES_FILE: &str = "_templates.csv";

/// Access to a tree of configuration files.
pub trait ConfigSource: Send {
    /// List the CSV files directly below `dir`.
    ///
    /// A non-empty `prefix` restricts to file names starting with it;
    /// with `skip_address_prefixed`, files following the `ZZ.` device
    /// scheme are left out. The query string is passed to remote
    /// sources for server side pre-filtering and ignored locally.
    fn list(
        &self,
        dir: &str,
        prefix: &str,
        skip_address_prefixed: bool,
        query: &str,
    ) -> Result<Vec<String>>;

    /// Subdirectories below `dir` (empty for remote sources).
    fn list_dirs(&self, _dir: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn fetch(&self, path: &str) -> Result<String>;
}

fn is_address_prefixed(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 3 && bytes[2] == b'.' && bytes[..2].iter().all(u8::is_ascii_hexdigit)
}

/// Configuration files from the local filesystem.
#[derive(Debug)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }

    fn dir_path(&self, dir: &str) -> PathBuf {
        if dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir)
        }
    }
}

impl ConfigSource for LocalSource {
    fn list(
        &self,
        dir: &str,
        prefix: &str,
        skip_address_prefixed: bool,
        _query: &str,
    ) -> Result<Vec<String>> {
        let path = self.dir_path(dir);
        log::debug!("reading directory {}", path.display());
        let entries = fs::read_dir(&path).map_err(|_| Error::NotFound)?;
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if !name.ends_with(".csv") || name == TEMPLATES_FILE {
                continue;
            }
            if !prefix.is_empty() {
                if !name.starts_with(prefix) {
                    continue;
                }
            } else if skip_address_prefixed && is_address_prefixed(&name) {
                continue;
            }
            files.push(name);
        }
        files.sort();
        Ok(files)
    }

    fn list_dirs(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.dir_path(dir);
        let entries = fs::read_dir(&path).map_err(|_| Error::NotFound)?;
        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                dirs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn fetch(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.root.join(path)).map_err(|_| Error::NotFound)
    }
}

/// Minimal HTTP access used by [`HttpSource`]; the actual client is an
/// external collaborator injected at startup.
pub trait HttpFetch: Send {
    fn get(&self, uri: &str) -> Result<String>;
}

/// Configuration files from a web service.
///
/// The directory listing is replaced by a server provided index; the
/// query parameters let the server pre-filter matching files.
pub struct HttpSource {
    client: Box<dyn HttpFetch>,
    base: String,
    lang_query: String,
}

impl HttpSource {
    pub fn new(client: Box<dyn HttpFetch>, base: &str, lang_query: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            lang_query: lang_query.to_string(),
        }
    }
}

impl ConfigSource for HttpSource {
    fn list(
        &self,
        dir: &str,
        prefix: &str,
        skip_address_prefixed: bool,
        query: &str,
    ) -> Result<Vec<String>> {
        let uri = format!("{}/{}?t=csv{}", self.base, dir, query);
        let index = self.client.get(&uri)?;
        let files = index
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && name.ends_with(".csv") && *name != TEMPLATES_FILE)
            .filter(|name| {
                if !prefix.is_empty() {
                    name.starts_with(prefix)
                } else {
                    !(skip_address_prefixed && is_address_prefixed(name))
                }
            })
            .map(str::to_string)
            .collect();
        Ok(files)
    }

    fn fetch(&self, path: &str) -> Result<String> {
        let uri = format!("{}/{}{}", self.base, path, self.lang_query);
        self.client.get(&uri)
    }
}

/// Helper for device scanning and config loading.
pub struct ScanHelper {
    catalog: Arc<RwLock<MessageCatalog>>,
    source: Box<dyn ConfigSource>,
    global_templates: FieldTemplates,
    templates_by_path: BTreeMap<String, FieldTemplates>,
    verbose: bool,
}

impl ScanHelper {
    pub fn new(
        catalog: Arc<RwLock<MessageCatalog>>,
        source: Box<dyn ConfigSource>,
        verbose: bool,
    ) -> Self {
        Self {
            catalog,
            source,
            global_templates: FieldTemplates::new(),
            templates_by_path: BTreeMap::new(),
            verbose,
        }
    }

    fn catalog_write(&self) -> RwLockWriteGuard<'_, MessageCatalog> {
        self.catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the message definitions from the configuration tree.
    pub fn load_config_files(&mut self) -> Result<()> {
        log::info!("loading configuration files");
        self.catalog_write().clear();
        self.global_templates.clear();
        self.templates_by_path.clear();
        let result = self.read_config_dir("");
        let catalog = self.catalog_write();
        match &result {
            Ok(()) => log::info!("read config files, got {} messages", catalog.len()),
            Err(e) => log::error!("error reading config files: {}", e),
        }
        result
    }

    fn read_config_dir(&mut self, dir: &str) -> Result<()> {
        let files = self.source.list(dir, "", false, "")?;
        self.read_templates(dir);
        for name in files {
            log::info!("reading file {}", self.join(dir, &name));
            self.load_file(dir, &name, None)?;
        }
        for sub in self.source.list_dirs(dir)? {
            let sub_dir = self.join(dir, &sub);
            self.read_config_dir(&sub_dir)?;
        }
        Ok(())
    }

    fn join(&self, dir: &str, name: &str) -> String {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        }
    }

    /// Ensure the templates of the directory are loaded, inheriting the
    /// global table. Returns whether the directory was new.
    fn read_templates(&mut self, dir: &str) -> bool {
        if self.templates_by_path.contains_key(dir) {
            return false;
        }
        let mut templates = if dir.is_empty() {
            FieldTemplates::new()
        } else {
            FieldTemplates::with_parent(&self.global_templates)
        };
        let path = self.join(dir, TEMPLATES_FILE);
        if let Ok(content) = self.source.fetch(&path) {
            log::info!("reading templates {}", if dir.is_empty() { "/" } else { dir });
            let catalog = self.catalog_write();
            match filereader::load_templates(&mut templates, &catalog, &content, &path) {
                Ok(()) => log::info!("read templates in {}", if dir.is_empty() { "/" } else { dir }),
                Err(e) => log::error!("error reading templates in {}: {}", dir, e),
            }
        }
        if dir.is_empty() {
            self.global_templates = templates.clone();
        }
        self.templates_by_path.insert(dir.to_string(), templates);
        true
    }

    /// The templates in effect for the given directory.
    pub fn templates_for(&self, dir: &str) -> &FieldTemplates {
        self.templates_by_path.get(dir).unwrap_or(&self.global_templates)
    }

    fn load_file(
        &mut self,
        dir: &str,
        name: &str,
        defaults: Option<&FilenameDefaults>,
    ) -> Result<()> {
        let rel = self.join(dir, name);
        let content = self.source.fetch(&rel)?;
        let includes = {
            let templates = self
                .templates_by_path
                .get(dir)
                .unwrap_or(&self.global_templates);
            let mut catalog = self.catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let result =
                filereader::load_definitions(&mut catalog, templates, &content, &rel, defaults)?;
            catalog.add_loaded_file(None, &rel, "");
            result.includes
        };
        for include in includes {
            self.load_file(dir, &include, None)?;
        }
        Ok(())
    }

    /// Extract the identification values of the scanned address from
    /// the catalog cache.
    fn ident_info(&self, address: u8) -> Result<(String, String, u32, u32)> {
        let mut catalog = self.catalog_write();
        let index = catalog.scan_message_for(address)?;
        let message = catalog.get(index).ok_or(Error::NotFound)?;
        if message.last_update_time() == 0 {
            return Err(Error::NotFound);
        }
        let data = message.last_slave_data();
        if data.data_size() < 10 {
            log::error!(
                "unable to load scan config {:02x}: slave part too short ({})",
                address,
                data.data_size()
            );
            return Err(Error::Empty);
        }
        let mut manufacturer = String::new();
        message.decode_last_data(Some(("mf", -1)), OutputFormat::NONE, &mut manufacturer)?;
        let mut ident = String::new();
        message.decode_last_data(Some(("id", -1)), OutputFormat::NONE, &mut ident)?;
        let mut sw_text = String::new();
        let sw = match message.decode_last_data(Some(("sw", -1)), OutputFormat::NONE, &mut sw_text)
        {
            Ok(()) => sw_text.parse().unwrap_or(0),
            // non-BCD version bytes: use the hex value instead
            Err(_) => (data.data_at(6) as u32) << 8 | data.data_at(7) as u32,
        };
        let mut hw_text = String::new();
        let hw = match message.decode_last_data(Some(("hw", -1)), OutputFormat::NONE, &mut hw_text)
        {
            Ok(()) => hw_text.parse().unwrap_or(0),
            Err(_) => (data.data_at(8) as u32) << 8 | data.data_at(9) as u32,
        };
        let manufacturer = manufacturer.to_lowercase();
        let ident: String = ident
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Ok((manufacturer, ident, sw, hw))
    }

    /// Select and load the configuration file matching the scan result
    /// of the address, returning the loaded file name.
    pub fn load_scan_config(&mut self, address: u8) -> Result<String> {
        let (manufacturer, ident, sw, hw) = self.ident_info(address)?;
        let prefix = format!("{:02x}.", address);
        let query = format!("&a={:02x}&i={}&h={}&s={}", address, ident, hw, sw);
        let files = match self.source.list(&manufacturer, &prefix, false, &query) {
            Ok(files) => files,
            Err(e) => {
                log::error!(
                    "unable to load scan config {:02x}: list files in {} {}",
                    address,
                    manufacturer,
                    e
                );
                return Err(e);
            }
        };
        if files.is_empty() {
            log::error!(
                "unable to load scan config {:02x}: no file from {} with prefix {} found",
                address,
                manufacturer,
                prefix
            );
            return Err(Error::NotFound);
        }
        log::debug!(
            "found {} matching scan config files from {} with prefix {}",
            files.len(),
            manufacturer,
            prefix
        );
        // complete name: MANUFACTURER/ZZ[.IDENT[.SUFFIX]*][.SWxxxx][.HWxxxx].csv
        let mut best: Option<(String, FilenameDefaults)> = None;
        let mut best_match = 0usize;
        for name in &files {
            let defaults = match extract_defaults_from_filename(name) {
                Some(defaults) => defaults,
                None => continue,
            };
            if defaults.dest != Some(address) {
                continue;
            }
            if defaults.sw.map_or(false, |v| v != sw) || defaults.hw.map_or(false, |v| v != hw) {
                continue;
            }
            let mut score = 1;
            if let Some(check) = defaults.ident.as_deref().filter(|i| !i.is_empty()) {
                let mut remain = ident.clone();
                let mut matches = false;
                while !remain.is_empty() && remain.len() >= check.len() {
                    if check == remain {
                        matches = true;
                        break;
                    }
                    if !remain.ends_with(|c: char| c.is_ascii_digit()) {
                        break;
                    }
                    remain.pop();
                }
                if !matches {
                    continue;
                }
                score += remain.len();
            }
            if score >= best_match {
                best_match = score;
                best = Some((name.clone(), defaults));
            }
        }
        let (best, mut defaults) = match best {
            Some(best) => best,
            None => {
                log::error!(
                    "unable to load scan config {:02x}: no file from {} with prefix {} matches ID \"{}\", SW{:04}, HW{:04}",
                    address, manufacturer, prefix, ident, sw, hw
                );
                return Err(Error::NotFound);
            }
        };
        // load the manufacturer templates and common files once
        if self.read_templates(&manufacturer) {
            if let Ok(common) = self.source.list(&manufacturer, "", true, "&a=-") {
                for name in common {
                    match self.load_file(&manufacturer, &name, None) {
                        Ok(()) => log::info!("read common config file {}/{}", manufacturer, name),
                        Err(e) => log::error!(
                            "error reading common config file {}/{}: {}",
                            manufacturer,
                            name,
                            e
                        ),
                    }
                }
            }
        }
        defaults.ident = Some(ident.clone());
        self.load_file(&manufacturer, &best, Some(&defaults))
            .map_err(|e| {
                log::error!(
                    "error reading scan config file {}/{} for ID \"{}\", SW{:04}, HW{:04}: {}",
                    manufacturer, best, ident, sw, hw, e
                );
                e
            })?;
        log::info!(
            "read scan config file {}/{} for ID \"{}\", SW{:04}, HW{:04}",
            manufacturer,
            best,
            ident,
            sw,
            hw
        );
        Ok(self.join(&manufacturer, &best))
    }

    /// Resolve conditions and replay the deferred read instructions.
    pub fn execute_instructions(&mut self, bus: &BusHandler) -> Result<()> {
        let reads = {
            let mut catalog = self.catalog_write();
            if let Err(e) = catalog.resolve_conditions() {
                log::error!("error resolving conditions: {}", e);
            }
            let mut reads = Vec::new();
            catalog
                .execute_instructions(|circuit, name| {
                    reads.push((circuit.to_string(), name.to_string()))
                })
                .ok();
            if self.verbose || !reads.is_empty() {
                log::info!(
                    "found messages: {} ({} conditional on {} conditions, {} poll, {} update)",
                    catalog.len(),
                    catalog.conditional_count(),
                    catalog.condition_count(),
                    catalog.poll_count(),
                    catalog.passive_count()
                );
            }
            reads
        };
        for (circuit, name) in reads {
            let index = {
                let catalog = self.catalog.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                catalog.find_by_name(&circuit, &name, "*", false)
            };
            match index {
                Some(index) => {
                    if let Err(e) = bus.read_from_bus(index, "", ebus::SYN, ebus::SYN) {
                        log::error!("error reading message {} {}: {}", circuit, name, e);
                    }
                }
                None => log::error!("error reading message {} {}: not found", circuit, name),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus::{DataTypeList, MasterFrame, SlaveFrame};
    use std::sync::Arc;

    struct MapSource {
        files: BTreeMap<String, String>,
    }

    impl MapSource {
        fn new(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }
    }

    impl ConfigSource for MapSource {
        fn list(
            &self,
            dir: &str,
            prefix: &str,
            skip_address_prefixed: bool,
            _query: &str,
        ) -> Result<Vec<String>> {
            let dir_prefix = if dir.is_empty() {
                String::new()
            } else {
                format!("{}/", dir)
            };
            let mut names: Vec<String> = self
                .files
                .keys()
                .filter_map(|path| path.strip_prefix(&dir_prefix))
                .filter(|name| !name.contains('/'))
                .filter(|name| name.ends_with(".csv") && *name != TEMPLATES_FILE)
                .filter(|name| {
                    if !prefix.is_empty() {
                        name.starts_with(prefix)
                    } else {
                        !(skip_address_prefixed && is_address_prefixed(name))
                    }
                })
                .map(str::to_string)
                .collect();
            names.sort();
            Ok(names)
        }

        fn fetch(&self, path: &str) -> Result<String> {
            self.files.get(path).cloned().ok_or(Error::NotFound)
        }
    }

    fn catalog_with_ident(address: u8) -> Arc<RwLock<MessageCatalog>> {
        let catalog = Arc::new(RwLock::new(MessageCatalog::new(Arc::new(
            DataTypeList::new(),
        ))));
        {
            let mut guard = catalog.write().unwrap();
            let index = guard.scan_message_for(address).unwrap();
            let master = MasterFrame::parse_hex(&format!("31{:02x}070400", address)).unwrap();
            // Vaillant, ident "ehp00", SW 0100, HW 0064
            let slave = SlaveFrame::parse_hex("0ab5656870303001000064").unwrap();
            guard.store_last_data(index, &master, &slave).unwrap();
        }
        catalog
    }

    #[test]
    fn scores_best_matching_file() {
        let catalog = catalog_with_ident(0x08);
        let source = MapSource::new(&[
            ("vaillant/08.csv", "r,main,,other,,,08,b509,01,x,s,UCH,,,\n"),
            (
                "vaillant/08.ehp.csv",
                "r,,,flow,,,08,b509,0d,temp,s,D2C,,°C,\n",
            ),
            (
                "vaillant/08.xyz.csv",
                "r,xyz,,flow,,,08,b509,0e,temp,s,D2C,,,\n",
            ),
        ]);
        let mut helper = ScanHelper::new(catalog.clone(), Box::new(source), false);
        let file = helper.load_scan_config(0x08).unwrap();
        assert_eq!(file, "vaillant/08.ehp.csv");
        let guard = catalog.read().unwrap();
        // circuit defaults to the device ident from the file name match
        assert!(guard.find_by_name("ehp00", "flow", "*", false).is_some());
    }

    #[test]
    fn version_constraints_must_match() {
        let catalog = catalog_with_ident(0x08);
        let source = MapSource::new(&[
            (
                "vaillant/08.ehp.SW0200.csv",
                "r,,,flow,,,08,b509,0d,temp,s,D2C,,,\n",
            ),
            (
                "vaillant/08.ehp.SW0100.csv",
                "r,,,flow,,,08,b509,0e,temp,s,D2C,,,\n",
            ),
        ]);
        let mut helper = ScanHelper::new(catalog, Box::new(source), false);
        let file = helper.load_scan_config(0x08).unwrap();
        assert_eq!(file, "vaillant/08.ehp.SW0100.csv");
    }

    #[test]
    fn missing_scan_data_fails() {
        let catalog = Arc::new(RwLock::new(MessageCatalog::new(Arc::new(
            DataTypeList::new(),
        ))));
        let source = MapSource::new(&[]);
        let mut helper = ScanHelper::new(catalog, Box::new(source), false);
        assert_eq!(helper.load_scan_config(0x08), Err(Error::NotFound));
    }

    #[test]
    fn common_files_loaded_once() {
        let catalog = catalog_with_ident(0x08);
        let source = MapSource::new(&[
            (
                "vaillant/broadcast.csv",
                "u,broadcast,,datetime,,,fe,0700,,time,m,UCH,,,\n",
            ),
            (
                "vaillant/08.ehp.csv",
                "r,,,flow,,,08,b509,0d,temp,s,D2C,,,\n",
            ),
        ]);
        let mut helper = ScanHelper::new(catalog.clone(), Box::new(source), false);
        helper.load_scan_config(0x08).unwrap();
        let guard = catalog.read().unwrap();
        assert!(guard.find_by_name("broadcast", "datetime", "*", false).is_some());
    }

    #[test]
    fn templates_inherited_per_directory() {
        let catalog = catalog_with_ident(0x08);
        let source = MapSource::new(&[
            ("vaillant/_templates.csv", "temp,D2C,,°C,\n"),
            (
                "vaillant/08.ehp.csv",
                "r,,,flow,,,08,b509,0d,temp,s,,,,\n",
            ),
        ]);
        let mut helper = ScanHelper::new(catalog.clone(), Box::new(source), false);
        helper.load_scan_config(0x08).unwrap();
        let guard = catalog.read().unwrap();
        let index = guard.find_by_name("ehp00", "flow", "*", false).unwrap();
        assert_eq!(guard.get(index).unwrap().fields.fields()[0].unit, "°C");
    }
}
