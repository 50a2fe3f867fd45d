use super::{
    exit_result::ExitResult,
    rewind_options::{RewindOptions, RewindSubCommand},
    RewindCommand,
    EXIT_CORRUPT,
};
use crate::{
    file_handles::FileHandle,
    page_store::{
        pagemap::{PagemapEntry, PagemapReader},
        SizeInfo,
    },
    savestate::{ParentRef, SavestateFile, SavestateFlags},
};
use serde::Serialize;
use std::path::PathBuf;

pub struct InfoCommand {
    savestate: PathBuf,
    pretty: bool,
}

impl InfoCommand {
    pub fn new(options: &RewindOptions) -> InfoCommand {
        match options.cmd.clone() {
            RewindSubCommand::Info { savestate, pretty } => InfoCommand { savestate, pretty },
            _ => panic!("Unexpected RewindSubCommand variant. Not an `Info` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadInfo {
    tid: i32,
    is_checkpoint_thread: bool,
    sigmask_bytes: usize,
    register_bytes: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegionInfo {
    start: String,
    end: String,
    prot: String,
    shared: bool,
    kind: String,
    name: String,
    captured: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SavestateInfo {
    format_version: u32,
    incremental: bool,
    generation: u64,
    parent: Option<ParentRef>,
    chain_depth: u32,
    pid: i32,
    created: u64,
    page_size: u32,
    block_pages: u32,
    threads: Vec<ThreadInfo>,
    regions: Vec<RegionInfo>,
    handles: Vec<FileHandle>,
    pages: SizeInfo,
}

/// Summarize `file`. Fails on a malformed pagemap.
fn describe(file: &SavestateFile) -> Result<SavestateInfo, String> {
    let meta = file.meta();
    let header = &meta.header;
    let mut pages = SizeInfo::default();
    for entry in PagemapReader::new(file.pagemap()) {
        pages.pages_total += 1;
        match entry? {
            PagemapEntry::Zero => pages.zero_pages += 1,
            PagemapEntry::Unchanged => pages.unchanged_pages += 1,
            PagemapEntry::Raw => pages.raw_pages += 1,
            PagemapEntry::Compressed(_) => pages.compressed_pages += 1,
        }
    }
    pages.payload_bytes = file.payload().len() as u64;
    pages.file_bytes = std::fs::metadata(file.path()).map_or(0, |m| m.len());

    Ok(SavestateInfo {
        format_version: file.preamble().version,
        incremental: file.preamble().flags().contains(SavestateFlags::INCREMENTAL),
        generation: header.generation,
        parent: header.parent.clone(),
        chain_depth: header.chain_depth,
        pid: header.pid,
        created: header.created,
        page_size: header.page_size,
        block_pages: header.block_pages,
        threads: header
            .threads
            .iter()
            .map(|t| ThreadInfo {
                tid: t.tid,
                is_checkpoint_thread: t.is_checkpoint_thread,
                sigmask_bytes: t.sigmask.len(),
                register_bytes: t.registers.len(),
            })
            .collect(),
        regions: meta
            .regions
            .iter()
            .map(|r| RegionInfo {
                start: format!("{:#x}", r.start().as_usize()),
                end: format!("{:#x}", r.end().as_usize()),
                prot: r.prot().prot_string(),
                shared: r.is_shared(),
                kind: r.kind().to_string(),
                name: r.fsname().to_owned(),
                captured: r.has_contents(),
            })
            .collect(),
        handles: meta.handles.clone(),
        pages,
    })
}

impl RewindCommand for InfoCommand {
    fn run(&mut self) -> ExitResult<()> {
        let file = match SavestateFile::open(&self.savestate) {
            Ok(f) => f,
            Err(e) => return ExitResult::err_from(e, EXIT_CORRUPT),
        };
        let info = match describe(&file) {
            Ok(info) => info,
            Err(reason) => {
                return ExitResult::err_from(
                    crate::error::CheckpointError::corrupt(file.path(), reason),
                    EXIT_CORRUPT,
                )
            }
        };
        let serialized = if self.pretty {
            serde_json::to_string_pretty(&info)
        } else {
            serde_json::to_string(&info)
        };
        match serialized {
            Ok(s) => {
                println!("{}", s);
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        address_space::test::ScratchMapping,
        page_store::page_writer::test::{save, scratch_region},
    };

    #[test]
    fn describes_a_savestate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.state");
        let scratch = ScratchMapping::new(3);
        scratch.bytes_mut()[0] = 1;
        let region = scratch_region(&scratch);
        save(&path, &[(region, vec![true; 3])], None, 256);

        let info = describe(&SavestateFile::open(&path).unwrap()).unwrap();
        assert_eq!(info.generation, 1);
        assert!(!info.incremental);
        assert_eq!(info.regions.len(), 1);
        assert!(info.regions[0].captured);
        assert_eq!(info.regions[0].prot, "rw-");
        assert_eq!(info.pages.pages_total, 3);
        assert_eq!(info.pages.zero_pages, 2);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["chainDepth"], 0);
        assert_eq!(json["pages"]["zero_pages"], 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = InfoCommand {
            savestate: dir.path().join("none.state"),
            pretty: false,
        };
        assert!(!cmd.run().is_ok());
    }
}
