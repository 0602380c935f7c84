use structopt::StructOpt;

use std::{ffi, process::exit};

use tsdms::{Config, Result, Tsdms};

#[derive(Debug, StructOpt)]
struct Opt {
    #[structopt(long = "ts_length")]
    ts_length: usize,

    #[structopt(long = "data_dir", default_value = "./data")]
    data_dir: ffi::OsString,

    #[structopt(long = "db_name", default_value = "db")]
    db_name: String,

    #[structopt(long = "flush_every", default_value = "10")]
    flush_every: usize,
}

fn main() {
    let opt = Opt::from_args();
    match run(opt) {
        Ok(_) => (),
        Err(err) => {
            eprintln!("error: {}", err);
            exit(1);
        }
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut config = Config::new(&opt.data_dir, &opt.db_name, opt.ts_length);
    config.set_flush_every(opt.flush_every);

    let db = match Tsdms::open(config.clone()) {
        Ok(db) => db,
        Err(tsdms::Error::InvalidFile(_, _)) => {
            println!("creating database {:?} under {:?}", opt.db_name, opt.data_dir);
            Tsdms::create(config)?
        }
        Err(err) => return Err(err),
    };

    let stats = db.stats()?;
    println!("database  {:?}", opt.db_name);
    println!("ts_length {}", db.as_config().ts_length);
    println!("live keys {}", stats.n_live);
    println!("seqno     {}", stats.seqno);
    println!("indexes   {}", stats.n_indexes);
    println!("triggers  {}", stats.n_triggers);
    println!("vps       {}", stats.n_vps);
    println!("isax      {}", stats.n_isax);
    for field in db.as_schema().as_fields() {
        println!("field     {:?} {:?} index:{:?}", field.name, field.ftype, field.index);
    }

    db.close()
}
