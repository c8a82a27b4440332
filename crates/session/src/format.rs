use filemesh_rpc::FileEntry;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Human-readable size: whole bytes below 1 KiB, otherwise two decimals.
pub fn format_file_size(size: u64) -> String {
    match size {
        s if s < KIB => format!("{s}B"),
        s if s < MIB => format!("{:.2}KB", s as f64 / KIB as f64),
        s if s < GIB => format!("{:.2}MB", s as f64 / MIB as f64),
        s => format!("{:.2}GB", s as f64 / GIB as f64),
    }
}

/// One `d  name size` or `-  name size` line per entry.
pub fn format_listing(entries: &[FileEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let marker = if entry.is_directory { 'd' } else { '-' };
            format!("{marker}  {} {}", entry.name, format_file_size(entry.size))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_nodes(nodes: &[(String, String)]) -> String {
    nodes
        .iter()
        .map(|(name, address)| format!("{name}: {address}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_pick_the_largest_fitting_unit() {
        assert_eq!(format_file_size(0), "0B");
        assert_eq!(format_file_size(1023), "1023B");
        assert_eq!(format_file_size(1024), "1.00KB");
        assert_eq!(format_file_size(1536), "1.50KB");
        assert_eq!(format_file_size(5 * MIB + MIB / 4), "5.25MB");
        assert_eq!(format_file_size(3 * GIB), "3.00GB");
    }

    #[test]
    fn listing_marks_directories() {
        let entries = vec![
            FileEntry {
                name: "docs".into(),
                is_directory: true,
                size: 4096,
            },
            FileEntry {
                name: "report.txt".into(),
                is_directory: false,
                size: 12,
            },
        ];
        assert_eq!(
            format_listing(&entries),
            "d  docs 4.00KB\n-  report.txt 12B"
        );
        assert_eq!(format_listing(&[]), "");
    }

    #[test]
    fn nodes_render_one_per_line() {
        let nodes = vec![
            ("n1".to_string(), "10.0.0.1:9000".to_string()),
            ("n2".to_string(), "10.0.0.2:9000".to_string()),
        ];
        assert_eq!(format_nodes(&nodes), "n1: 10.0.0.1:9000\nn2: 10.0.0.2:9000");
    }
}
