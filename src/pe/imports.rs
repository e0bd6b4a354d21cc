//! Names of the DLLs a native image imports from.

use crate::{
    file::parser::Parser,
    pe::headers::{DataDirectoryType, PeHeaders},
    Result,
};

const IMPORT_DESCRIPTOR_SIZE: usize = 20;

/// Reads the DLL names of the import directory, in table order.
///
/// Images without an import directory yield an empty list.
///
/// # Errors
/// Returns an error if a descriptor or a name can't be located in the file.
pub fn imported_dlls(data: &[u8], headers: &PeHeaders) -> Result<Vec<String>> {
    let directory = headers.directory(DataDirectoryType::Import);
    if directory.is_empty() {
        return Ok(Vec::new());
    }

    let mut parser = Parser::at(data, headers.rva_to_offset(directory.rva)?)?;
    let mut names = Vec::new();
    loop {
        if parser.remaining() < IMPORT_DESCRIPTOR_SIZE {
            return Err(out_of_bounds_error!());
        }

        let original_first_thunk = parser.read_le::<u32>()?;
        let _time_date_stamp = parser.read_le::<u32>()?;
        let _forwarder_chain = parser.read_le::<u32>()?;
        let name_rva = parser.read_le::<u32>()?;
        let first_thunk = parser.read_le::<u32>()?;

        if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
            break;
        }

        let mut name = Parser::at(data, headers.rva_to_offset(name_rva)?)?;
        names.push(name.read_string_utf8()?);
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{ImageBuilder, PeProbe};

    #[test]
    fn lists_imported_dlls() {
        let image = ImageBuilder::new()
            .import("KERNEL32.dll")
            .import("USER32.dll")
            .build()
            .unwrap();
        let PeProbe::Pe(headers) = PeHeaders::parse(&image).unwrap() else {
            panic!("not a PE image");
        };

        assert_eq!(
            imported_dlls(&image, &headers).unwrap(),
            vec!["KERNEL32.dll".to_string(), "USER32.dll".to_string()]
        );
    }

    #[test]
    fn no_imports() {
        let image = ImageBuilder::new().build().unwrap();
        let PeProbe::Pe(headers) = PeHeaders::parse(&image).unwrap() else {
            panic!("not a PE image");
        };
        assert!(imported_dlls(&image, &headers).unwrap().is_empty());
    }
}
