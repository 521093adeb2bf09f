pub mod rbdvol;
