use std::fs;
use std::io;

/// One loaded kernel module, from `/proc/modules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub size: usize,
    pub refcount: i32,
    pub dependents: Vec<String>,
}

pub fn modules() -> io::Result<Vec<Module>> {
    Ok(parse_modules(&fs::read_to_string("/proc/modules")?))
}

fn parse_modules(data: &str) -> Vec<Module> {
    data.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();

            let name = fields.next()?.to_string();
            let size = fields.next()?.parse().ok()?;
            let refcount = fields.next()?.parse().ok()?;
            let dependents = match fields.next() {
                Some("-") | None => Vec::new(),
                Some(list) => list
                    .trim_end_matches(',')
                    .split(',')
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect(),
            };

            Some(Module {
                name,
                size,
                refcount,
                dependents,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::parse_modules;

    #[test]
    fn decode_sample_lines() {
        let parsed = parse_modules(
            "nf_nat 49152 3 nf_nat_ftp,xt_nat,iptable_nat, Live 0x0000000000000000\n\
             loop 32768 0 - Live 0x0000000000000000\n",
        );

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "nf_nat");
        assert_eq!(parsed[0].size, 49152);
        assert_eq!(parsed[0].refcount, 3);
        assert_eq!(
            parsed[0].dependents,
            vec!["nf_nat_ftp", "xt_nat", "iptable_nat"]
        );
        assert!(parsed[1].dependents.is_empty());
    }
}
